//! Per-session element selection with a detached working copy.
//!
//! ```text
//!            select(id)                  apply → ops
//!   Idle ─────────────────► Selected ─────────────────► Idle
//!    ▲                        │   ▲                      (original shown
//!    │        cancel          │   │ edit working copy     only if no net
//!    └────────────────────────┘   └──┘                    change)
//! ```
//!
//! While an element is selected its original is hidden and all edits go to
//! the working copy. Applying diffs the copy against the original and yields
//! the edits to persist. Selecting another element while one is selected
//! follows the configured [`ReselectPolicy`].

use serde_json::Value;

use crate::model::{Element, ModelHandle, ReplayError};
use crate::record::{EditOp, ElementId, OpKind};

const EPSILON: f64 = 1e-9;

/// What to do with a pending edit when another element gets selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReselectPolicy {
    /// Drop the pending edit and restore the previous element.
    #[default]
    Discard,
    /// Turn the pending edit into operations before switching.
    Apply,
}

/// A selected element and its editable copy.
#[derive(Debug, Clone)]
pub struct Selection {
    original: Element,
    working: Element,
}

impl Selection {
    pub fn target_id(&self) -> &ElementId {
        &self.original.id
    }

    pub fn original(&self) -> &Element {
        &self.original
    }

    pub fn working_copy(&self) -> &Element {
        &self.working
    }

    /// Edits that turn the original into the working copy.
    pub fn diff(&self) -> Vec<EditOp> {
        let (a, b) = (&self.original, &self.working);
        let id = a.id.clone();
        let mut ops = Vec::new();

        let delta = sub(b.position, a.position);
        if !is_zero(delta) {
            ops.push(EditOp::translate(id.clone(), delta));
        }
        let delta = sub(b.rotation, a.rotation);
        if !is_zero(delta) {
            ops.push(EditOp::rotate(id.clone(), delta));
        }
        if a.material != b.material {
            let payload = serde_json::json!({ "material": b.material });
            ops.push(EditOp::new(OpKind::SetMaterial, id.clone(), payload));
        }
        if a.samples != b.samples {
            let samples = serde_json::to_value(&b.samples).unwrap_or(Value::Null);
            ops.push(EditOp::update_samples(id.clone(), samples));
        }
        if a.geometry != b.geometry {
            ops.push(geometry_op(id, b));
        }
        ops
    }

    pub fn has_changes(&self) -> bool {
        !self.diff().is_empty()
    }
}

fn geometry_op(id: ElementId, element: &Element) -> EditOp {
    match &element.geometry.primitive {
        Some(primitive) => EditOp::new(OpKind::OverrideGeometry, id, primitive.clone()),
        None => {
            let geometry = serde_json::to_value(&element.geometry).unwrap_or(Value::Null);
            EditOp::edit_geometry(id, geometry)
        }
    }
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn is_zero(v: [f64; 3]) -> bool {
    v.iter().all(|c| c.abs() < EPSILON)
}

/// Selection state of one session.
#[derive(Debug, Default)]
pub struct SelectionMachine {
    current: Option<Selection>,
    policy: ReselectPolicy,
}

impl SelectionMachine {
    pub fn new(policy: ReselectPolicy) -> Self {
        Self {
            current: None,
            policy,
        }
    }

    pub fn policy(&self) -> ReselectPolicy {
        self.policy
    }

    pub fn is_selected(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&Selection> {
        self.current.as_ref()
    }

    /// Select an element, detaching a working copy and hiding the original.
    ///
    /// Returns the operations produced by a pending selection when the
    /// policy is [`ReselectPolicy::Apply`]; empty otherwise.
    pub fn select<M: ModelHandle + ?Sized>(
        &mut self,
        model: &mut M,
        target: &ElementId,
    ) -> Result<Vec<EditOp>, ReplayError> {
        let element = model
            .element(target)
            .cloned()
            .ok_or_else(|| ReplayError::TargetMissing {
                target: target.clone(),
                op_id: uuid::Uuid::nil(),
            })?;

        let pending = match self.policy {
            ReselectPolicy::Discard => {
                self.cancel(model);
                Vec::new()
            }
            ReselectPolicy::Apply => self.apply(model),
        };

        model.set_visible(target, false)?;
        self.current = Some(Selection {
            original: element.clone(),
            working: element,
        });
        log::debug!("Selected {target}");
        Ok(pending)
    }

    /// Edits the current selection would produce, leaving it selected.
    pub fn pending(&self) -> Vec<EditOp> {
        self.current.as_ref().map(Selection::diff).unwrap_or_default()
    }

    /// End the selection once its edits reached the model, showing the
    /// updated original again.
    pub fn finish<M: ModelHandle + ?Sized>(&mut self, model: &mut M) {
        if let Some(selection) = self.current.take() {
            restore(model, selection.target_id());
        }
    }

    /// Mutable access to the working copy of the current selection.
    pub fn working_copy_mut(&mut self) -> Option<&mut Element> {
        self.current.as_mut().map(|s| &mut s.working)
    }

    /// Finish the selection, returning the edits to persist.
    ///
    /// The original is shown again only when nothing changed; otherwise it
    /// stays hidden and the caller shows it once the edits are applied.
    pub fn apply<M: ModelHandle + ?Sized>(&mut self, model: &mut M) -> Vec<EditOp> {
        let Some(selection) = self.current.take() else {
            return Vec::new();
        };
        let ops = selection.diff();
        if ops.is_empty() {
            restore(model, selection.target_id());
        }
        ops
    }

    /// Drop the working copy and show the original again.
    pub fn cancel<M: ModelHandle + ?Sized>(&mut self, model: &mut M) {
        if let Some(selection) = self.current.take() {
            restore(model, selection.target_id());
            log::debug!("Selection of {} cancelled", selection.target_id());
        }
    }
}

fn restore<M: ModelHandle + ?Sized>(model: &mut M, target: &ElementId) {
    // The element may have been deleted by a remote edit meanwhile.
    if let Err(e) = model.set_visible(target, true) {
        log::debug!("Could not restore visibility: {e}");
    }
}
