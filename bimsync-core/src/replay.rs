//! Deterministic replay of operation records onto a model.
//!
//! ```text
//! batch ──sort (created_at, seq)──► for each record:
//!                                     ├─ already applied?  → skip (duplicate)
//!                                     ├─ normalize payload
//!                                     ├─ model.apply_operation
//!                                     │     └─ error → skip, log, continue
//!                                     └─ mark applied
//!        ──► model.render()  (once per batch, only if something applied)
//! ```
//!
//! Replaying the same records twice, in any split into batches, leaves the
//! model exactly as one replay would.

use std::collections::HashSet;
use uuid::Uuid;

use crate::model::{ModelHandle, ReplayError};
use crate::normalize::normalize_persisted;
use crate::record::{sort_canonical, PersistedRecord, Timestamp};

/// Outcome of one [`ReplayEngine::apply`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    pub applied: usize,
    pub duplicates: usize,
    /// Records skipped because the model could not apply them
    pub skipped: Vec<(Uuid, ReplayError)>,
}

impl ReplayReport {
    pub fn changed(&self) -> bool {
        self.applied > 0
    }
}

/// Applies records to a model at most once each.
#[derive(Debug, Default)]
pub struct ReplayEngine {
    /// Content identities already applied in this session
    applied: HashSet<Uuid>,
    /// `created_at` of the newest applied record
    last_applied: Option<Timestamp>,
}

impl ReplayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch in canonical order.
    pub fn apply<M: ModelHandle + ?Sized>(
        &mut self,
        model: &mut M,
        mut records: Vec<PersistedRecord>,
    ) -> ReplayReport {
        sort_canonical(&mut records);
        let mut report = ReplayReport::default();

        for record in records {
            let op_id = record.op_id();
            if self.applied.contains(&op_id) {
                report.duplicates += 1;
                continue;
            }
            if record.model_id() != model.model_id() {
                log::warn!(
                    "Skipping op {op_id}: belongs to model {}, not {}",
                    record.model_id(),
                    model.model_id()
                );
                continue;
            }

            let record = normalize_persisted(record);
            match model.apply_operation(&record.record) {
                Ok(()) => {
                    self.applied.insert(op_id);
                    self.last_applied = self.last_applied.max(Some(record.created_at));
                    report.applied += 1;
                }
                Err(e) => {
                    log::warn!("Skipping op {op_id} ({:?}): {e}", record.record.kind);
                    // A record that cannot apply now never will; treat it as consumed.
                    self.applied.insert(op_id);
                    report.skipped.push((op_id, e));
                }
            }
        }

        if report.changed() {
            model.render();
        }
        log::debug!(
            "Replayed batch: {} applied, {} duplicate, {} skipped",
            report.applied,
            report.duplicates,
            report.skipped.len()
        );
        report
    }

    /// Whether a record with this identity was already consumed.
    pub fn has_applied(&self, op_id: &Uuid) -> bool {
        self.applied.contains(op_id)
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn last_applied(&self) -> Option<Timestamp> {
        self.last_applied
    }

    /// Forget all applied identities (the model is being rebuilt).
    pub fn reset(&mut self) {
        self.applied.clear();
        self.last_applied = None;
    }
}
