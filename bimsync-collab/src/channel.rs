//! Push channels: per-model streams of change events.
//!
//! A [`PushChannel`] opens one [`Subscription`] per call. The subscription
//! is an mpsc receiver; the channel closes it (`recv` returns `None`) when
//! the underlying transport fails, and releases the transport when the
//! receiver is dropped.
//!
//! - [`WsPushChannel`] subscribes over WebSocket to the log service.
//! - [`LocalPushChannel`] follows an in-process [`MemoryEditLog`](crate::storage::MemoryEditLog).

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

use bimsync_core::ModelId;

use crate::protocol::{ChangeEvent, MessageType, ProtocolError, WireMessage};

/// Receiving end of one model subscription.
pub type Subscription = mpsc::Receiver<ChangeEvent>;

/// Events buffered per subscription before the producer waits.
const SUBSCRIPTION_CAPACITY: usize = 256;

/// Push channel failure. Recovered by the notifier (retry, then polling).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("subscription rejected: {0}")]
    Rejected(String),
    #[error("subscription timed out")]
    Timeout,
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Source of real-time change events.
pub trait PushChannel: Send + Sync + 'static {
    /// Open a stream of change events for one model.
    ///
    /// Resolves once the remote side acknowledged the subscription.
    fn subscribe(
        &self,
        model_id: &ModelId,
    ) -> impl Future<Output = Result<Subscription, ChannelError>> + Send;
}

/// Subscribes to the log service over WebSocket.
#[derive(Debug, Clone)]
pub struct WsPushChannel {
    url: String,
}

impl WsPushChannel {
    /// `url` is the log service endpoint, e.g. `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl PushChannel for WsPushChannel {
    async fn subscribe(&self, model_id: &ModelId) -> Result<Subscription, ChannelError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let request = WireMessage::subscribe(1, model_id.clone()).encode()?;
        ws_sender
            .send(Message::Binary(request.into()))
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;

        // Wait for the acknowledgement; events cannot precede it.
        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let reply = WireMessage::decode(&data)?;
                    match reply.msg_type {
                        MessageType::Subscribed => break,
                        MessageType::Error => {
                            return Err(ChannelError::Rejected(
                                reply.error_message().unwrap_or_default(),
                            ))
                        }
                        other => log::debug!("Ignoring {other:?} before subscription ack"),
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_sender.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => return Err(ChannelError::Closed),
                Some(Err(e)) => return Err(ChannelError::Connect(e.to_string())),
                Some(Ok(_)) => {}
            }
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let model_id = model_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    frame = ws_receiver.next() => match frame {
                        Some(Ok(Message::Binary(data))) => match WireMessage::decode(&data) {
                            Ok(msg) if msg.msg_type == MessageType::Event => {
                                match msg.json::<ChangeEvent>() {
                                    Ok(event) => {
                                        if tx.send(event).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("Dropping undecodable event for {model_id}: {e}")
                                    }
                                }
                            }
                            Ok(msg) if msg.msg_type == MessageType::Ping => {
                                if let Ok(pong) = WireMessage::pong().encode() {
                                    let _ = ws_sender.send(Message::Binary(pong.into())).await;
                                }
                            }
                            Ok(_) => {}
                            Err(e) => log::warn!("Failed to decode frame for {model_id}: {e}"),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_sender.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Push channel for {model_id} closed by server");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("Push channel for {model_id} failed: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Push channel over an in-process change feed.
#[derive(Debug, Clone)]
pub struct LocalPushChannel {
    feed: broadcast::Sender<ChangeEvent>,
}

impl LocalPushChannel {
    pub fn new(feed: broadcast::Sender<ChangeEvent>) -> Self {
        Self { feed }
    }
}

impl PushChannel for LocalPushChannel {
    async fn subscribe(&self, model_id: &ModelId) -> Result<Subscription, ChannelError> {
        let mut feed = self.feed.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let model_id = model_id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = feed.recv() => match event {
                        Ok(event) if event.record.model_id() == &model_id => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            // Missed events: close so the subscriber catches up by query.
                            log::warn!("Local feed for {model_id} lagged by {n} events");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{EditLog, MemoryEditLog};
    use bimsync_core::{AuthorId, EditOp, OperationEncoder};

    #[tokio::test]
    async fn test_local_channel_filters_by_model() {
        let log = MemoryEditLog::new();
        let channel = log.push_channel();
        let mut sub = channel.subscribe(&ModelId::from("a")).await.unwrap();

        for model in ["b", "a"] {
            let records = OperationEncoder::new(ModelId::from(model), AuthorId::new("u"))
                .normalize_all(vec![EditOp::translate("wall-12", [1.0, 0.0, 0.0])]);
            log.append(&ModelId::from(model), records).await.unwrap();
        }

        let event = sub.recv().await.unwrap();
        assert_eq!(event.record.model_id().as_str(), "a");
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ws_channel_connect_failure() {
        // Nothing listens on port 1.
        let channel = WsPushChannel::new("ws://127.0.0.1:1");
        let err = channel.subscribe(&ModelId::from("m")).await.unwrap_err();
        assert!(matches!(err, ChannelError::Connect(_)));
    }
}
