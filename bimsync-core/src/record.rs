//! Operation records: the atomic, replayable unit of change.
//!
//! A record moves through three shapes:
//!
//! ```text
//! EditOp ──encode──► OperationRecord ──append──► PersistedRecord
//! (local edit)       (op_id, author)             (created_at, sequence_order)
//! ```
//!
//! Persisted records are immutable. Their total order per model is
//! `(created_at, sequence_order)`, and `op_id` is the content identity used
//! to drop re-deliveries.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

/// Identity of a shared model. Every participant editing the same asset
/// uses the same id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of an element inside a model (e.g. `"wall-12"`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElementId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ElementId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque originating session/user. Used for attribution and coloring only,
/// never for conflict arbitration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorId(String);

impl AuthorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A random author id for anonymous sessions.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-assigned timestamp, microseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros();
        Self(micros as u64)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Wall-clock time of day as `HH:MM:SS` (UTC).
    pub fn format_hms(&self) -> String {
        let secs = self.0 / 1_000_000;
        let day = secs % 86_400;
        format!("{:02}:{:02}:{:02}", day / 3600, (day % 3600) / 60, day % 60)
    }
}

/// Operation kind. Decides how replay interprets the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// Relative move: `{dx, dy, dz}`
    Translate,
    /// Relative rotation in radians: `{rx, ry, rz}`
    Rotate,
    /// Absolute placement: `{position: [x,y,z], rotation: [x,y,z]}`
    SetTransform,
    /// Material assignment: `{material}`
    SetMaterial,
    /// Full sample map of the element: `{samples: {key: value}}`
    UpdateSamples,
    /// Geometry edit: `{geometry: {profiles, bigProfiles, holes, bigHoles}}`
    EditGeometry,
    /// Replace the representation with a primitive: `{shape, size}`
    OverrideGeometry,
    /// Remove the element.
    Delete,
}

impl OpKind {
    /// Human readable name for history lists.
    pub fn display_name(&self) -> &'static str {
        match self {
            OpKind::Translate => "Translate",
            OpKind::Rotate => "Rotate",
            OpKind::SetTransform => "Set transform",
            OpKind::SetMaterial => "Set material",
            OpKind::UpdateSamples => "Update samples",
            OpKind::EditGeometry => "Edit geometry",
            OpKind::OverrideGeometry => "Override geometry",
            OpKind::Delete => "Delete element",
        }
    }
}

/// A raw edit produced locally, before encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOp {
    pub kind: OpKind,
    pub target_id: ElementId,
    pub payload: Value,
}

impl EditOp {
    pub fn new(kind: OpKind, target_id: impl Into<ElementId>, payload: Value) -> Self {
        Self {
            kind,
            target_id: target_id.into(),
            payload,
        }
    }

    pub fn translate(target_id: impl Into<ElementId>, delta: [f64; 3]) -> Self {
        Self::new(
            OpKind::Translate,
            target_id,
            json!({ "dx": delta[0], "dy": delta[1], "dz": delta[2] }),
        )
    }

    pub fn rotate(target_id: impl Into<ElementId>, delta: [f64; 3]) -> Self {
        Self::new(
            OpKind::Rotate,
            target_id,
            json!({ "rx": delta[0], "ry": delta[1], "rz": delta[2] }),
        )
    }

    pub fn set_transform(
        target_id: impl Into<ElementId>,
        position: [f64; 3],
        rotation: [f64; 3],
    ) -> Self {
        Self::new(
            OpKind::SetTransform,
            target_id,
            json!({ "position": position, "rotation": rotation }),
        )
    }

    pub fn set_material(target_id: impl Into<ElementId>, material: impl Into<String>) -> Self {
        Self::new(
            OpKind::SetMaterial,
            target_id,
            json!({ "material": material.into() }),
        )
    }

    pub fn update_samples(target_id: impl Into<ElementId>, samples: Value) -> Self {
        Self::new(OpKind::UpdateSamples, target_id, json!({ "samples": samples }))
    }

    pub fn edit_geometry(target_id: impl Into<ElementId>, geometry: Value) -> Self {
        Self::new(OpKind::EditGeometry, target_id, json!({ "geometry": geometry }))
    }

    /// Swap the element's representation for a cube of edge `size`.
    pub fn override_with_cube(target_id: impl Into<ElementId>, size: f64) -> Self {
        Self::new(
            OpKind::OverrideGeometry,
            target_id,
            json!({ "shape": "cube", "size": size }),
        )
    }

    pub fn delete(target_id: impl Into<ElementId>) -> Self {
        Self::new(OpKind::Delete, target_id, json!({}))
    }
}

/// An encoded operation, ready to be appended to the edit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Content identity, assigned once at encode time
    pub op_id: Uuid,
    pub model_id: ModelId,
    pub kind: OpKind,
    pub target_id: ElementId,
    pub payload: Value,
    pub author_id: AuthorId,
    /// Soft-delete marker reserved for undo; replay ignores it
    #[serde(default)]
    pub undone: bool,
}

/// A record as stored in the edit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    #[serde(flatten)]
    pub record: OperationRecord,
    /// Position within the appended batch
    pub sequence_order: u32,
    /// Authoritative ordering key
    pub created_at: Timestamp,
}

impl PersistedRecord {
    pub fn op_id(&self) -> Uuid {
        self.record.op_id
    }

    pub fn model_id(&self) -> &ModelId {
        &self.record.model_id
    }

    /// Total-order key within one model's log.
    pub fn order_key(&self) -> (Timestamp, u32) {
        (self.created_at, self.sequence_order)
    }

    /// Encode as JSON text, the form the log and the wire carry.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Sort records into canonical replay order.
pub fn sort_canonical(records: &mut [PersistedRecord]) {
    records.sort_by_key(PersistedRecord::order_key);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(created_at: u64, seq: u32) -> PersistedRecord {
        PersistedRecord {
            record: OperationRecord {
                op_id: Uuid::new_v4(),
                model_id: ModelId::from("medium_test"),
                kind: OpKind::Translate,
                target_id: ElementId::from("wall-12"),
                payload: json!({ "dx": 1.0, "dy": 0.0, "dz": 0.0 }),
                author_id: AuthorId::new("10.0.0.1"),
                undone: false,
            },
            sequence_order: seq,
            created_at: Timestamp(created_at),
        }
    }

    #[test]
    fn test_persisted_record_json_is_flat() {
        let record = sample_record(42, 0);
        let value: Value = serde_json::from_slice(&record.to_json().unwrap()).unwrap();

        assert_eq!(value["kind"], "translate");
        assert_eq!(value["target_id"], "wall-12");
        assert_eq!(value["created_at"], 42);
        assert!(value.get("record").is_none());
    }

    #[test]
    fn test_persisted_record_json_roundtrip() {
        let record = sample_record(7, 3);
        let decoded = PersistedRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_undone_defaults_to_false() {
        let record = sample_record(1, 0);
        let mut value: Value = serde_json::from_slice(&record.to_json().unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("undone");

        let decoded: PersistedRecord = serde_json::from_value(value).unwrap();
        assert!(!decoded.record.undone);
    }

    #[test]
    fn test_sort_canonical_breaks_ties_by_sequence() {
        let mut records = vec![sample_record(5, 1), sample_record(2, 0), sample_record(5, 0)];
        sort_canonical(&mut records);

        let keys: Vec<_> = records.iter().map(|r| r.order_key()).collect();
        assert_eq!(
            keys,
            vec![(Timestamp(2), 0), (Timestamp(5), 0), (Timestamp(5), 1)]
        );
    }

    #[test]
    fn test_timestamp_format_hms() {
        // 13:05:09 on some day, in microseconds
        let ts = Timestamp(((3 * 86_400) + 13 * 3600 + 5 * 60 + 9) * 1_000_000 + 123);
        assert_eq!(ts.format_hms(), "13:05:09");
    }

    #[test]
    fn test_edit_op_builders() {
        let op = EditOp::translate("wall-12", [1.0, 0.0, 0.0]);
        assert_eq!(op.kind, OpKind::Translate);
        assert_eq!(op.payload["dx"], 1.0);

        let op = EditOp::override_with_cube("slab-1", 1.0);
        assert_eq!(op.payload["shape"], "cube");
        assert_eq!(op.kind.display_name(), "Override geometry");
    }
}
