//! Change notification: push with polling fallback.
//!
//! ```text
//!            ┌─ subscribe ok ──► Push ── channel closed ──► reconnect once ─┐
//! Connecting ┤      ▲                                          │ ok         │ failed
//!            │      └──────────────────────────────────────────┘            ▼
//!            └─ max_attempts failures (backoff 1s, 2s, 4s, …) ─────────► Polling
//! ```
//!
//! Both paths feed the same [`Watermark`]: a record is delivered to the
//! subscriber at most once, by whichever path sees it first. Each successful
//! subscribe is followed by a catch-up query so records appended while the
//! channel was down are not lost. Only query results move the query cursor;
//! pushed events can arrive out of log order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use bimsync_core::{normalize_batch, sort_canonical, ModelId, PersistedRecord, Timestamp};

use crate::channel::{ChannelError, PushChannel, Subscription};
use crate::protocol::ChangeKind;
use crate::storage::EditLog;

/// Notifier configuration.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Polling period once push is abandoned (default: 3s)
    pub poll_interval: Duration,
    /// First reconnect delay, doubled after each failure (default: 1s)
    pub backoff_base: Duration,
    /// Subscribe attempts before falling back to polling (default: 5)
    pub max_attempts: u32,
    /// A subscribe not acknowledged within this counts as failed (default: 10s)
    pub subscribe_timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            backoff_base: Duration::from_secs(1),
            max_attempts: 5,
            subscribe_timeout: Duration::from_secs(10),
        }
    }
}

/// How a subscription currently receives records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Connecting,
    Push,
    Polling,
    Cancelled,
}

/// Records already delivered to one subscriber.
#[derive(Debug, Default)]
pub struct Watermark {
    /// Newest `created_at` covered by a log query
    last_seen: Option<Timestamp>,
    seen: HashSet<Uuid>,
}

impl Watermark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter out records already seen, mark the rest, and return them in
    /// canonical order. The query cursor is left alone.
    pub fn admit(&mut self, records: Vec<PersistedRecord>) -> Vec<PersistedRecord> {
        let mut fresh: Vec<PersistedRecord> = records
            .into_iter()
            .filter(|record| self.seen.insert(record.op_id()))
            .collect();
        sort_canonical(&mut fresh);
        fresh
    }

    /// [`admit`](Self::admit) the complete result of a log query, then move
    /// the query cursor to its newest record.
    pub fn admit_queried(&mut self, records: Vec<PersistedRecord>) -> Vec<PersistedRecord> {
        if let Some(newest) = records.iter().map(|r| r.created_at).max() {
            self.last_seen = self.last_seen.max(Some(newest));
        }
        self.admit(records)
    }

    /// Mark records delivered by other means (the session's own appends).
    ///
    /// Only identities are recorded; `last_seen` is left alone so a poll
    /// still covers remote records older than these.
    pub fn mark_seen<'a>(&mut self, records: impl IntoIterator<Item = &'a PersistedRecord>) {
        self.seen.extend(records.into_iter().map(PersistedRecord::op_id));
    }

    pub fn last_seen(&self) -> Option<Timestamp> {
        self.last_seen
    }

    pub fn contains(&self, op_id: &Uuid) -> bool {
        self.seen.contains(op_id)
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

/// Watermark shared by a subscription's delivery paths and its owner.
pub type SharedWatermark = Arc<Mutex<Watermark>>;

fn lock(watermark: &SharedWatermark) -> MutexGuard<'_, Watermark> {
    watermark.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Spawns per-model subscriptions over a log and a push channel.
pub struct ChangeNotifier<L: EditLog, C: PushChannel> {
    log: Arc<L>,
    channel: Arc<C>,
    config: NotifierConfig,
}

impl<L: EditLog, C: PushChannel> Clone for ChangeNotifier<L, C> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            channel: self.channel.clone(),
            config: self.config.clone(),
        }
    }
}

impl<L: EditLog, C: PushChannel> ChangeNotifier<L, C> {
    pub fn new(log: Arc<L>, channel: Arc<C>, config: NotifierConfig) -> Self {
        Self { log, channel, config }
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    /// Deliver every new record of `model_id` to `on_records`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn subscribe<F>(&self, model_id: &ModelId, on_records: F) -> SubscriptionHandle
    where
        F: FnMut(Vec<PersistedRecord>) + Send + Sync + 'static,
    {
        self.subscribe_from(model_id, Arc::new(Mutex::new(Watermark::new())), on_records)
    }

    /// Like [`subscribe`](Self::subscribe), resuming from an existing watermark.
    pub fn subscribe_from<F>(
        &self,
        model_id: &ModelId,
        watermark: SharedWatermark,
        on_records: F,
    ) -> SubscriptionHandle
    where
        F: FnMut(Vec<PersistedRecord>) + Send + Sync + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (mode_tx, _) = watch::channel(DeliveryMode::Connecting);
        let mode = Arc::new(mode_tx);

        let worker = Worker {
            model_id: model_id.clone(),
            log: self.log.clone(),
            channel: self.channel.clone(),
            config: self.config.clone(),
            watermark: watermark.clone(),
            cancelled: cancelled.clone(),
            mode: mode.clone(),
            on_records,
        };
        let task = tokio::spawn(worker.run());

        SubscriptionHandle {
            model_id: model_id.clone(),
            cancelled,
            mode,
            watermark,
            task,
        }
    }
}

/// Owner's side of a running subscription. Dropping it cancels.
pub struct SubscriptionHandle {
    model_id: ModelId,
    cancelled: Arc<AtomicBool>,
    mode: Arc<watch::Sender<DeliveryMode>>,
    watermark: SharedWatermark,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Stop retries and polling and release the channel. Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.task.abort();
        self.mode.send_replace(DeliveryMode::Cancelled);
        log::info!("Subscription for model {} cancelled", self.model_id);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> DeliveryMode {
        *self.mode.borrow()
    }

    /// Follow delivery mode changes.
    pub fn mode_watch(&self) -> watch::Receiver<DeliveryMode> {
        self.mode.subscribe()
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    pub fn watermark(&self) -> &SharedWatermark {
        &self.watermark
    }

    /// Record that these records reached the subscriber by other means.
    pub fn mark_seen(&self, records: &[PersistedRecord]) {
        lock(&self.watermark).mark_seen(records);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Push,
    CatchUp,
    Poll,
}

struct Worker<L, C, F> {
    model_id: ModelId,
    log: Arc<L>,
    channel: Arc<C>,
    config: NotifierConfig,
    watermark: SharedWatermark,
    cancelled: Arc<AtomicBool>,
    mode: Arc<watch::Sender<DeliveryMode>>,
    on_records: F,
}

impl<L, C, F> Worker<L, C, F>
where
    L: EditLog,
    C: PushChannel,
    F: FnMut(Vec<PersistedRecord>) + Send + Sync + 'static,
{
    async fn run(mut self) {
        let mut subscription = self.connect_with_backoff().await;

        while let Some(sub) = subscription {
            self.set_mode(DeliveryMode::Push);
            log::info!("Receiving changes for model {} by push", self.model_id);
            self.catch_up(Source::CatchUp).await;
            self.pump(sub).await;
            if self.is_cancelled() {
                return;
            }

            log::warn!("Push channel for model {} closed; reconnecting", self.model_id);
            self.set_mode(DeliveryMode::Connecting);
            subscription = match self.open().await {
                Ok(sub) => Some(sub),
                Err(e) => {
                    log::warn!("Reconnect for model {} failed: {e}", self.model_id);
                    None
                }
            };
        }

        self.poll_forever().await;
    }

    /// Subscribe, retrying with exponential backoff.
    async fn connect_with_backoff(&self) -> Option<Subscription> {
        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.open().await {
                Ok(sub) => return Some(sub),
                Err(e) => {
                    log::warn!(
                        "Subscribe attempt {attempt}/{max_attempts} for model {} failed: {e}",
                        self.model_id
                    );
                    if attempt < max_attempts {
                        let factor = 1u32 << (attempt - 1).min(16);
                        tokio::time::sleep(self.config.backoff_base.saturating_mul(factor)).await;
                    }
                }
            }
        }
        None
    }

    async fn open(&self) -> Result<Subscription, ChannelError> {
        let subscribe = self.channel.subscribe(&self.model_id);
        match tokio::time::timeout(self.config.subscribe_timeout, subscribe).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout),
        }
    }

    /// Deliver pushed inserts until the channel closes.
    async fn pump(&mut self, mut sub: Subscription) {
        while let Some(event) = sub.recv().await {
            let mut batch = Vec::new();
            let mut next = Some(event);
            while let Some(event) = next {
                match event.kind {
                    ChangeKind::Insert => batch.push(event.record),
                    other => {
                        log::debug!("Ignoring {other:?} event for op {}", event.record.op_id())
                    }
                }
                next = sub.try_recv().ok();
            }
            self.deliver(batch, Source::Push);
        }
    }

    async fn poll_forever(&mut self) {
        self.set_mode(DeliveryMode::Polling);
        log::info!(
            "Falling back to polling for model {} every {:?}",
            self.model_id,
            self.config.poll_interval
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.is_cancelled() {
                return;
            }
            self.catch_up(Source::Poll).await;
        }
    }

    /// Query records newer than the watermark and deliver them.
    async fn catch_up(&mut self, source: Source) {
        let after = lock(&self.watermark).last_seen();
        match self.log.query(&self.model_id, after).await {
            Ok(records) => self.deliver(records, source),
            Err(e) => log::warn!("{source:?} query for model {} failed: {e}", self.model_id),
        }
    }

    fn deliver(&mut self, records: Vec<PersistedRecord>, source: Source) {
        if records.is_empty() || self.is_cancelled() {
            return;
        }
        let records = normalize_batch(records);
        let fresh = {
            let mut watermark = lock(&self.watermark);
            match source {
                Source::Push => watermark.admit(records),
                Source::CatchUp | Source::Poll => watermark.admit_queried(records),
            }
        };
        if fresh.is_empty() {
            return;
        }
        // Results that raced a cancel are dropped.
        if self.is_cancelled() {
            return;
        }
        log::debug!("Delivering {} records for model {} by {source:?}", fresh.len(), self.model_id);
        (self.on_records)(fresh);
    }

    fn set_mode(&self, mode: DeliveryMode) {
        if !self.is_cancelled() {
            self.mode.send_replace(mode);
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChangeEvent;
    use crate::storage::MemoryEditLog;
    use bimsync_core::{AuthorId, EditOp, OperationEncoder};
    use tokio::sync::mpsc;

    /// Channel whose subscriptions the test feeds by hand.
    #[derive(Default)]
    struct ScriptedChannel {
        senders: Mutex<Vec<mpsc::Sender<ChangeEvent>>>,
        failing: AtomicBool,
        attempts: std::sync::atomic::AtomicU32,
    }

    impl ScriptedChannel {
        fn failing() -> Self {
            let channel = Self::default();
            channel.failing.store(true, Ordering::SeqCst);
            channel
        }

        async fn push(&self, record: &PersistedRecord) {
            let senders = self.senders.lock().unwrap().clone();
            for tx in senders {
                let _ = tx.send(ChangeEvent::insert(record.clone())).await;
            }
        }

        /// Close open subscriptions and fail every later subscribe.
        fn sever(&self) {
            self.failing.store(true, Ordering::SeqCst);
            self.senders.lock().unwrap().clear();
        }
    }

    impl PushChannel for ScriptedChannel {
        async fn subscribe(&self, _model_id: &ModelId) -> Result<Subscription, ChannelError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ChannelError::Connect("refused".into()));
            }
            let (tx, rx) = mpsc::channel(16);
            self.senders.lock().unwrap().push(tx);
            Ok(rx)
        }
    }

    type Delivered = Arc<Mutex<Vec<PersistedRecord>>>;

    fn collector() -> (Delivered, impl FnMut(Vec<PersistedRecord>) + Send + Sync + 'static) {
        let delivered: Delivered = Arc::default();
        let sink = delivered.clone();
        (delivered, move |records| sink.lock().unwrap().extend(records))
    }

    async fn append(log: &MemoryEditLog, model: &ModelId) -> PersistedRecord {
        let records = OperationEncoder::new(model.clone(), AuthorId::new("a"))
            .normalize_all(vec![EditOp::translate("wall-12", [1.0, 0.0, 0.0])]);
        log.append(model, records).await.unwrap().remove(0)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn test_watermark_admits_once() {
        let model = ModelId::from("m");
        let encoder = OperationEncoder::new(model, AuthorId::new("a"));
        let records: Vec<PersistedRecord> = encoder
            .normalize_all(vec![EditOp::delete("a"), EditOp::delete("b")])
            .into_iter()
            .enumerate()
            .map(|(i, record)| PersistedRecord {
                record,
                sequence_order: 0,
                created_at: Timestamp(10 + i as u64),
            })
            .collect();

        let mut watermark = Watermark::new();
        watermark.mark_seen(&records[..1]);
        let fresh = watermark.admit(records.clone());
        assert_eq!(fresh, records[1..].to_vec());
        assert!(watermark.admit(records.clone()).is_empty());

        // Only query results move the cursor.
        assert_eq!(watermark.last_seen(), None);
        assert!(watermark.admit_queried(records).is_empty());
        assert_eq!(watermark.last_seen(), Some(Timestamp(11)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_push_does_not_skip_older_records() {
        let log = Arc::new(MemoryEditLog::new());
        let channel = Arc::new(ScriptedChannel::default());
        let model = ModelId::from("m");

        let notifier = ChangeNotifier::new(log.clone(), channel.clone(), NotifierConfig::default());
        let (delivered, on_records) = collector();
        let handle = notifier.subscribe(&model, on_records);
        settle().await;
        assert_eq!(handle.mode(), DeliveryMode::Push);

        // r2 is pushed, r1's event never arrives.
        let r1 = append(&log, &model).await;
        let r2 = append(&log, &model).await;
        channel.push(&r2).await;
        settle().await;

        channel.sever();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(handle.mode(), DeliveryMode::Polling);

        let ids: Vec<Uuid> = delivered.lock().unwrap().iter().map(PersistedRecord::op_id).collect();
        assert_eq!(ids, vec![r2.op_id(), r1.op_id()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retries() {
        let log = Arc::new(MemoryEditLog::new());
        let channel = Arc::new(ScriptedChannel::failing());
        let model = ModelId::from("m");
        append(&log, &model).await;

        let notifier = ChangeNotifier::new(log.clone(), channel.clone(), NotifierConfig::default());
        let (delivered, on_records) = collector();
        let handle = notifier.subscribe(&model, on_records);

        // Attempts at 0s and 1s; the next one is due at 3s.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(handle.mode(), DeliveryMode::Connecting);

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(handle.mode(), DeliveryMode::Cancelled);
        assert!(delivered.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_polling_after_retry_budget() {
        let log = Arc::new(MemoryEditLog::new());
        let channel = Arc::new(ScriptedChannel::failing());
        let model = ModelId::from("m");
        let first = append(&log, &model).await;

        let notifier = ChangeNotifier::new(log.clone(), channel.clone(), NotifierConfig::default());
        let (delivered, on_records) = collector();
        let handle = notifier.subscribe(&model, on_records);

        // Attempts at 0s, 1s, 3s, 7s and 15s.
        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(handle.mode(), DeliveryMode::Connecting);
        assert!(delivered.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.mode(), DeliveryMode::Polling);
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 5);
        assert_eq!(delivered.lock().unwrap().clone(), vec![first]);

        let second = append(&log, &model).await;
        tokio::time::sleep(NotifierConfig::default().poll_interval).await;
        assert_eq!(delivered.lock().unwrap().last(), Some(&second));
        assert_eq!(delivered.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_double_delivery_across_push_and_poll() {
        let log = Arc::new(MemoryEditLog::new());
        let channel = Arc::new(ScriptedChannel::default());
        let model = ModelId::from("m");
        let r1 = append(&log, &model).await;

        let notifier = ChangeNotifier::new(log.clone(), channel.clone(), NotifierConfig::default());
        let (delivered, on_records) = collector();
        let handle = notifier.subscribe(&model, on_records);
        settle().await;
        assert_eq!(handle.mode(), DeliveryMode::Push);

        // r1 arrives by catch-up, then again by push.
        channel.push(&r1).await;
        let r2 = append(&log, &model).await;
        channel.push(&r2).await;
        settle().await;

        channel.sever();
        settle().await;
        assert_eq!(handle.mode(), DeliveryMode::Polling);

        let r3 = append(&log, &model).await;
        tokio::time::sleep(Duration::from_secs(4)).await;

        let ids: Vec<Uuid> = delivered.lock().unwrap().iter().map(PersistedRecord::op_id).collect();
        assert_eq!(ids, vec![r1.op_id(), r2.op_id(), r3.op_id()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_push_with_catch_up() {
        let log = Arc::new(MemoryEditLog::new());
        let channel = Arc::new(ScriptedChannel::default());
        let model = ModelId::from("m");

        let notifier = ChangeNotifier::new(log.clone(), channel.clone(), NotifierConfig::default());
        let (delivered, on_records) = collector();
        let handle = notifier.subscribe(&model, on_records);
        settle().await;

        // Drop the live subscription; the next subscribe succeeds.
        let missed = append(&log, &model).await;
        channel.senders.lock().unwrap().clear();
        settle().await;

        assert_eq!(handle.mode(), DeliveryMode::Push);
        assert_eq!(channel.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(delivered.lock().unwrap().clone(), vec![missed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_delivery() {
        let log = Arc::new(MemoryEditLog::new());
        let channel = Arc::new(ScriptedChannel::failing());
        let model = ModelId::from("m");
        let config = NotifierConfig {
            max_attempts: 1,
            ..NotifierConfig::default()
        };

        let notifier = ChangeNotifier::new(log.clone(), channel, config);
        let (delivered, on_records) = collector();
        let handle = notifier.subscribe(&model, on_records);
        settle().await;
        assert_eq!(handle.mode(), DeliveryMode::Polling);

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(handle.mode(), DeliveryMode::Cancelled);

        append(&log, &model).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(delivered.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_records_are_not_redelivered() {
        let log = Arc::new(MemoryEditLog::new());
        let model = ModelId::from("m");
        let channel = Arc::new(log.push_channel());

        let notifier = ChangeNotifier::new(log.clone(), channel, NotifierConfig::default());
        let (delivered, on_records) = collector();
        let handle = notifier.subscribe(&model, on_records);
        settle().await;

        // The in-memory append does not yield, so the worker cannot see the
        // pushed event before the record is marked.
        let own = append(&log, &model).await;
        handle.mark_seen(std::slice::from_ref(&own));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(delivered.lock().unwrap().is_empty());
        assert!(handle.watermark().lock().unwrap().contains(&own.op_id()));

        let other = append(&log, &model).await;
        settle().await;
        assert_eq!(delivered.lock().unwrap().clone(), vec![other]);
    }
}
