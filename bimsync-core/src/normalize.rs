//! Operation encoding and payload normalization.
//!
//! Keyed geometry collections (profiles, holes) use sparse, non-contiguous
//! keys, so their canonical form is a JSON object keyed by string. Text
//! round-trips and foreign producers degrade them into other shapes:
//!
//! | Incoming shape                     | Canonical result                  |
//! |------------------------------------|-----------------------------------|
//! | `{"3": a, "7": b}`                 | unchanged                         |
//! | `[["3", a], [7, b]]` (map entries) | `{"3": a, "7": b}`, last key wins |
//! | `[a, null, b]` (sparse array)      | `{"0": a, "2": b}`                |
//! | `null`                             | unchanged                         |
//! | string / number / bool             | unchanged, reported as malformed  |
//!
//! Normalization is idempotent and never fails: a malformed field is passed
//! through and logged, because a best-effort replay beats a stalled pipeline.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::record::{AuthorId, EditOp, ModelId, OperationRecord, PersistedRecord};

/// Geometry fields holding sparse keyed collections.
pub const KEYED_GEOMETRY_FIELDS: [&str; 4] = ["profiles", "bigProfiles", "holes", "bigHoles"];

/// A payload field that could not be coerced into a keyed mapping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed payload field `{path}`: expected a keyed mapping, found {found}")]
pub struct MalformedField {
    pub path: String,
    pub found: &'static str,
}

/// Normalize the keyed collections of a payload in place.
///
/// Returns the fields left untouched because they had no mapping-like shape.
pub fn normalize_payload(payload: &mut Value) -> Vec<MalformedField> {
    let mut malformed = Vec::new();

    let geometry = match payload.get_mut("geometry") {
        Some(Value::Object(geometry)) => geometry,
        Some(Value::Null) | None => return malformed,
        Some(other) => {
            malformed.push(MalformedField {
                path: "geometry".to_string(),
                found: shape_name(other),
            });
            return malformed;
        }
    };

    for field in KEYED_GEOMETRY_FIELDS {
        if let Some(value) = geometry.get_mut(field) {
            if let Err(found) = coerce_keyed(value) {
                malformed.push(MalformedField {
                    path: format!("geometry.{field}"),
                    found,
                });
            }
        }
    }

    malformed
}

/// Normalize a record loaded back from the log or a delivery channel.
pub fn normalize_persisted(mut record: PersistedRecord) -> PersistedRecord {
    for field in normalize_payload(&mut record.record.payload) {
        log::warn!("Record {}: {field}", record.record.op_id);
    }
    record
}

/// Normalize a batch of persisted records.
pub fn normalize_batch(records: Vec<PersistedRecord>) -> Vec<PersistedRecord> {
    records.into_iter().map(normalize_persisted).collect()
}

/// Turns raw local edits into canonical operation records for one model.
#[derive(Debug, Clone)]
pub struct OperationEncoder {
    model_id: ModelId,
    author_id: AuthorId,
}

impl OperationEncoder {
    pub fn new(model_id: ModelId, author_id: AuthorId) -> Self {
        Self { model_id, author_id }
    }

    /// Encode one local edit, assigning its content identity.
    pub fn normalize(&self, raw: EditOp) -> OperationRecord {
        let EditOp {
            kind,
            target_id,
            mut payload,
        } = raw;

        for field in normalize_payload(&mut payload) {
            log::warn!("Local {kind:?} edit on {target_id}: {field}");
        }

        OperationRecord {
            op_id: Uuid::new_v4(),
            model_id: self.model_id.clone(),
            kind,
            target_id,
            payload,
            author_id: self.author_id.clone(),
            undone: false,
        }
    }

    /// Encode a batch, preserving order.
    pub fn normalize_all(&self, raw: Vec<EditOp>) -> Vec<OperationRecord> {
        raw.into_iter().map(|op| self.normalize(op)).collect()
    }

    pub fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    pub fn author_id(&self) -> &AuthorId {
        &self.author_id
    }
}

fn coerce_keyed(value: &mut Value) -> Result<(), &'static str> {
    let items = match value {
        Value::Object(_) | Value::Null => return Ok(()),
        Value::Array(items) => std::mem::take(items),
        other => return Err(shape_name(other)),
    };

    let map = if is_entry_list(&items) {
        entries_to_map(items)
    } else {
        sparse_array_to_map(items)
    };
    *value = Value::Object(map);
    Ok(())
}

/// `[[key, value], ...]` with string or integer keys.
fn is_entry_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items.iter().all(|item| match item.as_array() {
            Some(pair) if pair.len() == 2 => entry_key(&pair[0]).is_some(),
            _ => false,
        })
}

fn entry_key(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) if n.is_u64() || n.is_i64() => Some(n.to_string()),
        _ => None,
    }
}

fn entries_to_map(items: Vec<Value>) -> Map<String, Value> {
    let mut map = Map::new();
    for item in items {
        if let Value::Array(mut pair) = item {
            let value = pair.pop().unwrap_or(Value::Null);
            if let Some(key) = pair.first().and_then(entry_key) {
                map.insert(key, value);
            }
        }
    }
    map
}

fn sparse_array_to_map(items: Vec<Value>) -> Map<String, Value> {
    items
        .into_iter()
        .enumerate()
        .filter(|(_, v)| !v.is_null())
        .map(|(i, v)| (i.to_string(), v))
        .collect()
}

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
