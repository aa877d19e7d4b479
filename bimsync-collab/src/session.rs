//! One user's editing session on one model.
//!
//! ```text
//! Uninitialized ──start──► Initializing ──► Active ──teardown──► TearingDown ──► Inactive
//!                               │ load / query failed                              ▲
//!                               └──────────────────────────────────────────────────┘
//! ```
//!
//! The controller owns the model, the replay engine, the selection state and
//! the subscription. Remote records are queued by the notifier and applied
//! when the owner calls [`SessionController::process_remote`] or
//! [`SessionController::next_remote`]. Local edits reach the model only after
//! the log accepted them.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;

use bimsync_core::{
    normalize_batch, AuthorId, EditOp, Element, ElementId, GeometryEngine, ModelHandle, ModelId,
    ModelLoadError, OperationEncoder, PersistedRecord, ReplayEngine, ReplayError, ReplayReport,
    ReselectPolicy, SelectionMachine,
};
use uuid::Uuid;

use crate::channel::PushChannel;
use crate::history::{history_entries, HistoryEntry};
use crate::notifier::{ChangeNotifier, NotifierConfig, SubscriptionHandle, Watermark};
use crate::storage::{EditLog, PersistenceError};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Stamped on every record this session appends
    pub author_id: AuthorId,
    /// What selecting while a selection is pending does (default: discard)
    pub reselect_policy: ReselectPolicy,
    pub notifier: NotifierConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            author_id: AuthorId::random(),
            reselect_policy: ReselectPolicy::default(),
            notifier: NotifierConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn for_author(author_id: impl Into<String>) -> Self {
        Self {
            author_id: AuthorId::new(author_id),
            ..Self::default()
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Active,
    TearingDown,
    Inactive,
}

/// Session errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("operation not allowed while session is {0:?}")]
    InvalidState(SessionState),
    #[error("nothing is selected")]
    NoSelection,
    #[error("history index {index} out of range ({len} entries)")]
    HistoryIndex { index: usize, len: usize },
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
}

/// Everything that exists only while the session is active.
struct ActiveParts<M> {
    model: M,
    /// Base snapshot the model was loaded from
    base: Vec<u8>,
    /// Model as of a past history entry, see `jump_to`
    history_view: Option<(usize, M)>,
    encoder: OperationEncoder,
    subscription: SubscriptionHandle,
    remote: mpsc::UnboundedReceiver<Vec<PersistedRecord>>,
}

/// Borrow the active parts, leaving the controller's other fields free.
fn active<M>(
    state: SessionState,
    parts: &mut Option<ActiveParts<M>>,
) -> Result<&mut ActiveParts<M>, SessionError> {
    match (state, parts.as_mut()) {
        (SessionState::Active, Some(parts)) => Ok(parts),
        (state, _) => Err(SessionError::InvalidState(state)),
    }
}

pub struct SessionController<E: GeometryEngine, L: EditLog, C: PushChannel> {
    engine: E,
    log: Arc<L>,
    notifier: ChangeNotifier<L, C>,
    config: SessionConfig,
    state: SessionState,
    replay: ReplayEngine,
    selection: SelectionMachine,
    active: Option<ActiveParts<E::Model>>,
}

impl<E, L, C> SessionController<E, L, C>
where
    E: GeometryEngine,
    L: EditLog,
    C: PushChannel,
{
    pub fn new(engine: E, log: Arc<L>, channel: Arc<C>, config: SessionConfig) -> Self {
        let notifier = ChangeNotifier::new(log.clone(), channel, config.notifier.clone());
        Self {
            engine,
            log,
            notifier,
            selection: SelectionMachine::new(config.reselect_policy),
            config,
            state: SessionState::Uninitialized,
            replay: ReplayEngine::new(),
            active: None,
        }
    }

    /// Load the base model, replay its history and subscribe to changes.
    ///
    /// `base` overrides the log's model library. Any failure leaves the
    /// session `Inactive`.
    pub async fn start(
        &mut self,
        model_id: &ModelId,
        base: Option<&[u8]>,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Uninitialized {
            return Err(SessionError::InvalidState(self.state));
        }
        self.state = SessionState::Initializing;
        log::info!("Starting session on model {model_id} as {}", self.config.author_id);

        match self.initialize(model_id, base).await {
            Ok(parts) => {
                self.active = Some(parts);
                self.state = SessionState::Active;
                log::info!(
                    "Session on model {model_id} active ({} records replayed)",
                    self.replay.applied_count()
                );
                Ok(())
            }
            Err(e) => {
                log::error!("Session on model {model_id} failed to start: {e}");
                self.replay.reset();
                self.state = SessionState::Inactive;
                Err(e)
            }
        }
    }

    async fn initialize(
        &mut self,
        model_id: &ModelId,
        base: Option<&[u8]>,
    ) -> Result<ActiveParts<E::Model>, SessionError> {
        let bytes = match base {
            Some(bytes) => bytes.to_vec(),
            None => self
                .log
                .fetch_model(model_id)
                .await?
                .ok_or_else(|| ModelLoadError::Missing(model_id.clone()))?,
        };
        let mut model = self.engine.load_model(model_id, &bytes)?;

        let history = normalize_batch(self.log.query(model_id, None).await?);
        let report = self.replay.apply(&mut model, history.clone());
        if !report.skipped.is_empty() {
            log::warn!("{} historic records could not be applied", report.skipped.len());
        }

        // Start the watermark at the replayed history so nothing is delivered twice.
        let mut watermark = Watermark::new();
        watermark.admit_queried(history);

        let (tx, remote) = mpsc::unbounded_channel();
        let subscription = self.notifier.subscribe_from(
            model_id,
            Arc::new(Mutex::new(watermark)),
            move |records| {
                // Receiver gone means the session is tearing down.
                let _ = tx.send(records);
            },
        );

        Ok(ActiveParts {
            model,
            base: bytes,
            history_view: None,
            encoder: OperationEncoder::new(model_id.clone(), self.config.author_id.clone()),
            subscription,
            remote,
        })
    }

    // ─── Selection ────────────────────────────────────────────────────

    /// Select an element for editing.
    ///
    /// Under [`ReselectPolicy::Apply`] a pending selection is applied first;
    /// if that fails it stays selected and `target` is not selected.
    pub async fn select(&mut self, target: &ElementId) -> Result<(), SessionError> {
        let parts = active(self.state, &mut self.active)?;
        if parts.model.element(target).is_none() {
            return Err(ReplayError::TargetMissing {
                target: target.clone(),
                op_id: Uuid::nil(),
            }
            .into());
        }
        if self.selection.policy() == ReselectPolicy::Apply && self.selection.is_selected() {
            self.apply_selection().await?;
        }

        let parts = active(self.state, &mut self.active)?;
        self.selection.select(&mut parts.model, target)?;
        Ok(())
    }

    /// The detached working copy, if something is selected.
    pub fn working_copy_mut(&mut self) -> Option<&mut Element> {
        self.selection.working_copy_mut()
    }

    /// Modify the working copy of the current selection.
    pub fn edit(&mut self, f: impl FnOnce(&mut Element)) -> Result<(), SessionError> {
        active(self.state, &mut self.active)?;
        let working = self.selection.working_copy_mut().ok_or(SessionError::NoSelection)?;
        f(working);
        Ok(())
    }

    /// Persist the changes made to the working copy, then apply them.
    ///
    /// On append failure the selection and its working copy are kept, so
    /// the edit can be applied again or cancelled.
    pub async fn apply_selection(&mut self) -> Result<Vec<PersistedRecord>, SessionError> {
        active(self.state, &mut self.active)?;
        if !self.selection.is_selected() {
            return Err(SessionError::NoSelection);
        }

        let ops = self.selection.pending();
        let persisted = if ops.is_empty() { Vec::new() } else { self.submit(ops).await? };

        let parts = active(self.state, &mut self.active)?;
        self.selection.finish(&mut parts.model);
        Ok(persisted)
    }

    /// Discard the working copy.
    pub fn cancel_selection(&mut self) -> Result<(), SessionError> {
        let parts = active(self.state, &mut self.active)?;
        self.selection.cancel(&mut parts.model);
        Ok(())
    }

    // ─── Edits ────────────────────────────────────────────────────────

    /// Encode and append edits; apply them locally once persisted.
    pub async fn submit(&mut self, ops: Vec<EditOp>) -> Result<Vec<PersistedRecord>, SessionError> {
        let parts = active(self.state, &mut self.active)?;
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let model_id = parts.encoder.model_id().clone();
        let records = parts.encoder.normalize_all(ops);

        let persisted = match self.log.append(&model_id, records).await {
            Ok(persisted) => persisted,
            Err(e) => {
                log::error!("Append to model {model_id} failed, local model unchanged: {e}");
                return Err(e.into());
            }
        };

        let parts = active(self.state, &mut self.active)?;
        parts.subscription.mark_seen(&persisted);
        let report = self.replay.apply(&mut parts.model, persisted.clone());
        log::debug!("Applied {} own records to model {model_id}", report.applied);
        Ok(persisted)
    }

    // ─── Remote changes ───────────────────────────────────────────────

    /// Apply every remote batch already delivered, without waiting.
    pub fn process_remote(&mut self) -> Result<ReplayReport, SessionError> {
        let parts = active(self.state, &mut self.active)?;
        let mut batch = Vec::new();
        while let Ok(records) = parts.remote.try_recv() {
            batch.extend(records);
        }
        if batch.is_empty() {
            return Ok(ReplayReport::default());
        }
        Ok(self.replay.apply(&mut parts.model, batch))
    }

    /// Wait for the next remote batch and apply it together with anything
    /// else queued. `None` once the subscription has ended.
    pub async fn next_remote(&mut self) -> Result<Option<ReplayReport>, SessionError> {
        let parts = active(self.state, &mut self.active)?;
        let Some(mut batch) = parts.remote.recv().await else {
            return Ok(None);
        };
        while let Ok(records) = parts.remote.try_recv() {
            batch.extend(records);
        }
        Ok(Some(self.replay.apply(&mut parts.model, batch)))
    }

    // ─── History ──────────────────────────────────────────────────────

    /// The model's full edit history, oldest first.
    pub async fn history(&mut self) -> Result<Vec<HistoryEntry>, SessionError> {
        let records = self.history_records().await?;
        Ok(history_entries(&records))
    }

    /// Show the model as it was right after history entry `index`.
    ///
    /// The view is rebuilt from the base snapshot and available through
    /// [`history_view`](Self::history_view). The live model is untouched and
    /// nothing is appended.
    pub async fn jump_to(&mut self, index: usize) -> Result<HistoryEntry, SessionError> {
        let mut records = self.history_records().await?;
        let len = records.len();
        if index >= len {
            return Err(SessionError::HistoryIndex { index, len });
        }
        let entry = HistoryEntry::from_record(index, &records[index]);
        records.truncate(index + 1);

        let parts = active(self.state, &mut self.active)?;
        let mut view = self.engine.load_model(parts.encoder.model_id(), &parts.base)?;
        let report = ReplayEngine::new().apply(&mut view, normalize_batch(records));
        parts.history_view = Some((index, view));
        log::debug!(
            "Viewing history entry {index} ({}), {} records replayed",
            entry.kind_name(),
            report.applied
        );
        Ok(entry)
    }

    /// Drop the history view and return to the live model.
    pub fn leave_history(&mut self) {
        if let Some(parts) = self.active.as_mut() {
            parts.history_view = None;
        }
    }

    /// The model as of the entry last passed to [`jump_to`](Self::jump_to).
    pub fn history_view(&self) -> Option<(usize, &E::Model)> {
        self.active
            .as_ref()
            .and_then(|parts| parts.history_view.as_ref())
            .map(|(index, view)| (*index, view))
    }

    async fn history_records(&mut self) -> Result<Vec<PersistedRecord>, SessionError> {
        let model_id = active(self.state, &mut self.active)?.encoder.model_id().clone();
        let mut records = self.log.query(&model_id, None).await?;
        bimsync_core::sort_canonical(&mut records);
        Ok(records)
    }

    // ─── Teardown ─────────────────────────────────────────────────────

    /// Cancel the subscription, release the selection and drop the model.
    /// Idempotent.
    pub fn teardown(&mut self) {
        if matches!(self.state, SessionState::TearingDown | SessionState::Inactive) {
            return;
        }
        self.state = SessionState::TearingDown;

        if let Some(mut parts) = self.active.take() {
            parts.subscription.cancel();
            self.selection.cancel(&mut parts.model);
            log::info!("Session on model {} torn down", parts.encoder.model_id());
        }
        self.replay.reset();
        self.state = SessionState::Inactive;
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn model(&self) -> Option<&E::Model> {
        self.active.as_ref().map(|parts| &parts.model)
    }

    pub fn model_id(&self) -> Option<&ModelId> {
        self.active.as_ref().map(|parts| parts.encoder.model_id())
    }

    pub fn replay_engine(&self) -> &ReplayEngine {
        &self.replay
    }

    pub fn selection(&self) -> &SelectionMachine {
        &self.selection
    }

    pub fn subscription(&self) -> Option<&SubscriptionHandle> {
        self.active.as_ref().map(|parts| &parts.subscription)
    }
}

impl<E: GeometryEngine, L: EditLog, C: PushChannel> Drop for SessionController<E, L, C> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::LocalPushChannel;
    use crate::storage::MemoryEditLog;
    use bimsync_core::{SceneEngine, SceneModel};

    type Session = SessionController<SceneEngine, MemoryEditLog, LocalPushChannel>;

    fn base() -> Vec<u8> {
        SceneModel::new(
            ModelId::from("m"),
            vec![Element::new("wall-12"), Element::new("slab-1").with_material("concrete")],
        )
        .to_snapshot()
        .unwrap()
    }

    /// Memory log whose appends fail while `offline` is set.
    #[derive(Default)]
    struct SwitchableLog {
        inner: MemoryEditLog,
        offline: std::sync::atomic::AtomicBool,
    }

    impl SwitchableLog {
        fn set_offline(&self, offline: bool) {
            self.offline.store(offline, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl EditLog for SwitchableLog {
        async fn append(
            &self,
            model_id: &ModelId,
            records: Vec<bimsync_core::OperationRecord>,
        ) -> Result<Vec<PersistedRecord>, PersistenceError> {
            if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("offline".into()));
            }
            self.inner.append(model_id, records).await
        }

        async fn query(
            &self,
            model_id: &ModelId,
            after: Option<bimsync_core::Timestamp>,
        ) -> Result<Vec<PersistedRecord>, PersistenceError> {
            self.inner.query(model_id, after).await
        }

        async fn delete(
            &self,
            model_id: &ModelId,
            scope: crate::storage::DeleteScope,
        ) -> Result<usize, PersistenceError> {
            self.inner.delete(model_id, scope).await
        }
    }

    fn session(log: &Arc<MemoryEditLog>, author: &str) -> Session {
        let channel = Arc::new(log.push_channel());
        SessionController::new(SceneEngine, log.clone(), channel, SessionConfig::for_author(author))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let log = Arc::new(MemoryEditLog::new());
        let mut s = session(&log, "alice");
        assert_eq!(s.state(), SessionState::Uninitialized);
        assert!(matches!(
            s.submit(vec![EditOp::delete("wall-12")]).await,
            Err(SessionError::InvalidState(SessionState::Uninitialized))
        ));

        s.start(&ModelId::from("m"), Some(&base())).await.unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert!(matches!(
            s.start(&ModelId::from("m"), Some(&base())).await,
            Err(SessionError::InvalidState(SessionState::Active))
        ));

        s.teardown();
        s.teardown();
        assert_eq!(s.state(), SessionState::Inactive);
        assert!(s.model().is_none());
    }

    #[tokio::test]
    async fn test_missing_base_model_is_fatal() {
        let log = Arc::new(MemoryEditLog::new());
        let mut s = session(&log, "alice");
        let err = s.start(&ModelId::from("m"), None).await.unwrap_err();
        assert!(matches!(err, SessionError::ModelLoad(ModelLoadError::Missing(_))));
        assert_eq!(s.state(), SessionState::Inactive);
    }

    #[tokio::test]
    async fn test_base_from_model_library() {
        let log = Arc::new(MemoryEditLog::new());
        log.save_model(&ModelId::from("m"), base()).unwrap();
        let mut s = session(&log, "alice");
        s.start(&ModelId::from("m"), None).await.unwrap();
        assert_eq!(s.model().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_selection_edit_and_apply() {
        let log = Arc::new(MemoryEditLog::new());
        let mut s = session(&log, "alice");
        s.start(&ModelId::from("m"), Some(&base())).await.unwrap();

        let wall = ElementId::from("wall-12");
        s.select(&wall).await.unwrap();
        assert!(!s.model().unwrap().element(&wall).unwrap().visible);
        s.edit(|e| e.position[0] += 2.0).unwrap();

        let persisted = s.apply_selection().await.unwrap();
        assert_eq!(persisted.len(), 1);
        let element = s.model().unwrap().element(&wall).unwrap();
        assert_eq!(element.position, [2.0, 0.0, 0.0]);
        assert!(element.visible);
        assert!(s.replay_engine().has_applied(&persisted[0].op_id()));
        assert_eq!(log.record_count(&ModelId::from("m")), 1);
    }

    #[tokio::test]
    async fn test_reselect_apply_policy_submits_pending() {
        let log = Arc::new(MemoryEditLog::new());
        let channel = Arc::new(log.push_channel());
        let config = SessionConfig {
            reselect_policy: ReselectPolicy::Apply,
            ..SessionConfig::for_author("alice")
        };
        let mut s: Session = SessionController::new(SceneEngine, log.clone(), channel, config);
        s.start(&ModelId::from("m"), Some(&base())).await.unwrap();

        s.select(&ElementId::from("slab-1")).await.unwrap();
        s.edit(|e| e.material = Some("timber".into())).unwrap();
        s.select(&ElementId::from("wall-12")).await.unwrap();

        assert_eq!(log.record_count(&ModelId::from("m")), 1);
        let slab = s.model().unwrap().element(&"slab-1".into()).unwrap();
        assert_eq!(slab.material.as_deref(), Some("timber"));
    }

    #[tokio::test]
    async fn test_edit_without_selection() {
        let log = Arc::new(MemoryEditLog::new());
        let mut s = session(&log, "alice");
        s.start(&ModelId::from("m"), Some(&base())).await.unwrap();
        assert!(matches!(s.edit(|_| {}), Err(SessionError::NoSelection)));
        assert!(matches!(s.apply_selection().await, Err(SessionError::NoSelection)));
    }

    #[tokio::test]
    async fn test_reselect_apply_failure_keeps_pending_selection() {
        let log = Arc::new(SwitchableLog::default());
        let channel = Arc::new(log.inner.push_channel());
        let config = SessionConfig {
            reselect_policy: ReselectPolicy::Apply,
            ..SessionConfig::for_author("alice")
        };
        let mut s = SessionController::new(SceneEngine, log.clone(), channel, config);
        s.start(&ModelId::from("m"), Some(&base())).await.unwrap();

        let slab = ElementId::from("slab-1");
        let wall = ElementId::from("wall-12");
        s.select(&slab).await.unwrap();
        s.edit(|e| e.material = Some("timber".into())).unwrap();

        // Unknown targets are rejected before the pending edit is touched.
        assert!(matches!(
            s.select(&"door-404".into()).await,
            Err(SessionError::Replay(ReplayError::TargetMissing { .. }))
        ));
        assert_eq!(s.selection().current().unwrap().target_id(), &slab);

        log.set_offline(true);
        assert!(matches!(s.select(&wall).await, Err(SessionError::Persistence(_))));
        assert_eq!(s.selection().current().unwrap().target_id(), &slab);
        assert!(!s.model().unwrap().element(&slab).unwrap().visible);
        assert!(s.model().unwrap().element(&wall).unwrap().visible);

        log.set_offline(false);
        s.select(&wall).await.unwrap();
        let element = s.model().unwrap().element(&slab).unwrap();
        assert!(element.visible);
        assert_eq!(element.material.as_deref(), Some("timber"));
        assert_eq!(s.selection().current().unwrap().target_id(), &wall);
        assert_eq!(log.inner.record_count(&ModelId::from("m")), 1);
    }

    #[tokio::test]
    async fn test_history_and_jump() {
        let log = Arc::new(MemoryEditLog::new());
        let mut s = session(&log, "alice");
        s.start(&ModelId::from("m"), Some(&base())).await.unwrap();
        s.submit(vec![EditOp::translate("wall-12", [1.0, 0.0, 0.0])]).await.unwrap();
        s.submit(vec![EditOp::translate("wall-12", [1.0, 0.0, 0.0])]).await.unwrap();

        let history = s.history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].author_id.as_str(), "alice");

        let wall = ElementId::from("wall-12");
        let live = s.model().unwrap().state_digest();
        let entry = s.jump_to(0).await.unwrap();
        assert_eq!(entry.index, 0);

        let (index, view) = s.history_view().unwrap();
        assert_eq!(index, 0);
        assert_eq!(view.element(&wall).unwrap().position, [1.0, 0.0, 0.0]);
        assert_eq!(s.model().unwrap().element(&wall).unwrap().position, [2.0, 0.0, 0.0]);
        assert_eq!(s.model().unwrap().state_digest(), live);
        assert_eq!(s.replay_engine().applied_count(), 2);

        // The last entry matches a fresh replay of the whole log.
        s.jump_to(1).await.unwrap();
        assert_eq!(s.history_view().unwrap().1.state_digest(), live);

        s.leave_history();
        assert!(s.history_view().is_none());
        assert_eq!(log.record_count(&ModelId::from("m")), 2);

        assert!(matches!(
            s.jump_to(5).await,
            Err(SessionError::HistoryIndex { index: 5, len: 2 })
        ));
    }
}
