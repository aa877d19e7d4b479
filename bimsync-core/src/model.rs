//! Geometry engine boundary and the in-memory scene model.
//!
//! The real geometry engine (mesh building, rendering, picking) lives
//! outside this workspace. The sync layer only needs the narrow surface in
//! [`ModelHandle`] and [`GeometryEngine`]. [`SceneModel`] implements it over
//! plain element records, which is enough for headless sessions, tests and
//! benchmarks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::record::{ElementId, ModelId, OpKind, OperationRecord};

/// Why a single record could not be applied.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    #[error("target {target} not found (op {op_id})")]
    TargetMissing { target: ElementId, op_id: Uuid },
    #[error("model does not support {kind:?} operations")]
    Unsupported { kind: OpKind },
    #[error("invalid payload for op {op_id}: {reason}")]
    InvalidPayload { op_id: Uuid, reason: String },
}

/// Base model could not be loaded. Fatal to a session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelLoadError {
    #[error("model {0} has no base snapshot")]
    Missing(ModelId),
    #[error("base snapshot is empty")]
    Empty,
    #[error("base snapshot is corrupt: {0}")]
    Corrupt(String),
}

/// A live, mutable model owned by one session.
pub trait ModelHandle: Send {
    fn model_id(&self) -> &ModelId;

    /// Look up an element by id.
    fn element(&self, id: &ElementId) -> Option<&Element>;

    /// Mutate the model according to one record.
    fn apply_operation(&mut self, record: &OperationRecord) -> Result<(), ReplayError>;

    /// Show or hide an element (selection working copies hide the original).
    fn set_visible(&mut self, id: &ElementId, visible: bool) -> Result<(), ReplayError>;

    /// Signal that the model changed and the view should refresh.
    fn render(&mut self);
}

/// Builds model handles from base snapshot bytes.
pub trait GeometryEngine {
    type Model: ModelHandle;

    fn load_model(&self, model_id: &ModelId, bytes: &[u8]) -> Result<Self::Model, ModelLoadError>;
}

/// Keyed geometry collections of one element.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Geometry {
    pub profiles: BTreeMap<String, Value>,
    pub big_profiles: BTreeMap<String, Value>,
    pub holes: BTreeMap<String, Value>,
    pub big_holes: BTreeMap<String, Value>,
    /// Primitive override, e.g. `{"shape": "cube", "size": 1.0}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primitive: Option<Value>,
}

/// One addressable element of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    #[serde(default)]
    pub position: [f64; 3],
    #[serde(default)]
    pub rotation: [f64; 3],
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub samples: BTreeMap<String, Value>,
    #[serde(default)]
    pub geometry: Geometry,
    #[serde(default = "default_visible")]
    pub visible: bool,
}

fn default_visible() -> bool {
    true
}

impl Element {
    pub fn new(id: impl Into<ElementId>) -> Self {
        Self {
            id: id.into(),
            position: [0.0; 3],
            rotation: [0.0; 3],
            material: None,
            samples: BTreeMap::new(),
            geometry: Geometry::default(),
            visible: true,
        }
    }

    pub fn with_position(mut self, position: [f64; 3]) -> Self {
        self.position = position;
        self
    }

    pub fn with_material(mut self, material: impl Into<String>) -> Self {
        self.material = Some(material.into());
        self
    }
}

/// Serialized base model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneSnapshot {
    pub elements: Vec<Element>,
}

#[derive(Deserialize)]
struct TranslatePayload {
    #[serde(default)]
    dx: f64,
    #[serde(default)]
    dy: f64,
    #[serde(default)]
    dz: f64,
}

#[derive(Deserialize)]
struct RotatePayload {
    #[serde(default)]
    rx: f64,
    #[serde(default)]
    ry: f64,
    #[serde(default)]
    rz: f64,
}

#[derive(Deserialize)]
struct TransformPayload {
    position: [f64; 3],
    #[serde(default)]
    rotation: [f64; 3],
}

#[derive(Deserialize)]
struct MaterialPayload {
    material: Option<String>,
}

#[derive(Deserialize)]
struct SamplesPayload {
    samples: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct GeometryPayload {
    geometry: GeometryPatch,
}

/// Partial geometry: absent collections are left as they are.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeometryPatch {
    profiles: Option<BTreeMap<String, Value>>,
    big_profiles: Option<BTreeMap<String, Value>>,
    holes: Option<BTreeMap<String, Value>>,
    big_holes: Option<BTreeMap<String, Value>>,
}

/// In-memory model: a keyed set of elements.
#[derive(Debug, Clone)]
pub struct SceneModel {
    model_id: ModelId,
    elements: BTreeMap<ElementId, Element>,
    /// Number of "model changed" notifications received
    render_count: u64,
}

impl SceneModel {
    pub fn new(model_id: ModelId, elements: impl IntoIterator<Item = Element>) -> Self {
        Self {
            model_id,
            elements: elements.into_iter().map(|e| (e.id.clone(), e)).collect(),
            render_count: 0,
        }
    }

    /// Decode a JSON base snapshot.
    pub fn from_snapshot(model_id: ModelId, bytes: &[u8]) -> Result<Self, ModelLoadError> {
        if bytes.is_empty() {
            return Err(ModelLoadError::Empty);
        }
        let snapshot: SceneSnapshot = serde_json::from_slice(bytes)
            .map_err(|e| ModelLoadError::Corrupt(e.to_string()))?;
        Ok(Self::new(model_id, snapshot.elements))
    }

    /// Encode the current state as a base snapshot.
    pub fn to_snapshot(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&SceneSnapshot {
            elements: self.elements.values().cloned().collect(),
        })
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.values()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn render_count(&self) -> u64 {
        self.render_count
    }

    /// Canonical text of the model state, visibility excluded.
    ///
    /// Two models with equal digests hold identical geometry and attributes.
    pub fn state_digest(&self) -> String {
        let mut digest = Map::new();
        for (id, element) in &self.elements {
            let mut element = element.clone();
            element.visible = true;
            let value = serde_json::to_value(&element).unwrap_or(Value::Null);
            digest.insert(id.to_string(), value);
        }
        Value::Object(digest).to_string()
    }

    fn element_mut(&mut self, record: &OperationRecord) -> Result<&mut Element, ReplayError> {
        self.elements
            .get_mut(&record.target_id)
            .ok_or_else(|| ReplayError::TargetMissing {
                target: record.target_id.clone(),
                op_id: record.op_id,
            })
    }
}

fn decode<T: serde::de::DeserializeOwned>(record: &OperationRecord) -> Result<T, ReplayError> {
    T::deserialize(&record.payload).map_err(|e| ReplayError::InvalidPayload {
        op_id: record.op_id,
        reason: e.to_string(),
    })
}

impl ModelHandle for SceneModel {
    fn model_id(&self) -> &ModelId {
        &self.model_id
    }

    fn element(&self, id: &ElementId) -> Option<&Element> {
        self.elements.get(id)
    }

    fn apply_operation(&mut self, record: &OperationRecord) -> Result<(), ReplayError> {
        if record.kind == OpKind::Delete {
            return match self.elements.remove(&record.target_id) {
                Some(_) => Ok(()),
                None => Err(ReplayError::TargetMissing {
                    target: record.target_id.clone(),
                    op_id: record.op_id,
                }),
            };
        }

        // Each arm decodes before mutating, so a bad payload leaves the element intact.
        let element = self.element_mut(record)?;
        match record.kind {
            OpKind::Translate => {
                let p: TranslatePayload = decode(record)?;
                element.position[0] += p.dx;
                element.position[1] += p.dy;
                element.position[2] += p.dz;
            }
            OpKind::Rotate => {
                let p: RotatePayload = decode(record)?;
                element.rotation[0] += p.rx;
                element.rotation[1] += p.ry;
                element.rotation[2] += p.rz;
            }
            OpKind::SetTransform => {
                let p: TransformPayload = decode(record)?;
                element.position = p.position;
                element.rotation = p.rotation;
            }
            OpKind::SetMaterial => {
                let p: MaterialPayload = decode(record)?;
                element.material = p.material;
            }
            OpKind::UpdateSamples => {
                let p: SamplesPayload = decode(record)?;
                element.samples = p.samples;
            }
            OpKind::EditGeometry => {
                let GeometryPayload { geometry } = decode(record)?;
                let target = &mut element.geometry;
                if let Some(profiles) = geometry.profiles {
                    target.profiles = profiles;
                }
                if let Some(big_profiles) = geometry.big_profiles {
                    target.big_profiles = big_profiles;
                }
                if let Some(holes) = geometry.holes {
                    target.holes = holes;
                }
                if let Some(big_holes) = geometry.big_holes {
                    target.big_holes = big_holes;
                }
            }
            OpKind::OverrideGeometry => {
                if record.payload.get("shape").and_then(Value::as_str) != Some("cube") {
                    return Err(ReplayError::Unsupported { kind: record.kind });
                }
                element.geometry = Geometry {
                    primitive: Some(record.payload.clone()),
                    ..Geometry::default()
                };
            }
            OpKind::Delete => {}
        }
        Ok(())
    }

    fn set_visible(&mut self, id: &ElementId, visible: bool) -> Result<(), ReplayError> {
        match self.elements.get_mut(id) {
            Some(element) => {
                element.visible = visible;
                Ok(())
            }
            None => Err(ReplayError::TargetMissing {
                target: id.clone(),
                op_id: Uuid::nil(),
            }),
        }
    }

    fn render(&mut self) {
        self.render_count += 1;
    }
}

/// Loads [`SceneModel`]s from JSON snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct SceneEngine;

impl GeometryEngine for SceneEngine {
    type Model = SceneModel;

    fn load_model(&self, model_id: &ModelId, bytes: &[u8]) -> Result<SceneModel, ModelLoadError> {
        let model = SceneModel::from_snapshot(model_id.clone(), bytes)?;
        log::info!("Loaded model {model_id} with {} elements", model.len());
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AuthorId;
    use serde_json::json;

    fn record(kind: OpKind, target: &str, payload: Value) -> OperationRecord {
        OperationRecord {
            op_id: Uuid::new_v4(),
            model_id: ModelId::from("m"),
            kind,
            target_id: ElementId::from(target),
            payload,
            author_id: AuthorId::new("a"),
            undone: false,
        }
    }

    fn model() -> SceneModel {
        SceneModel::new(
            ModelId::from("m"),
            vec![
                Element::new("wall-12").with_position([1.0, 2.0, 3.0]),
                Element::new("slab-1"),
            ],
        )
    }

    #[test]
    fn test_translate_is_relative() {
        let mut m = model();
        m.apply_operation(&record(OpKind::Translate, "wall-12", json!({ "dx": 1.0, "dz": -1.0 })))
            .unwrap();
        assert_eq!(m.element(&"wall-12".into()).unwrap().position, [2.0, 2.0, 2.0]);
    }

    #[test]
    fn test_set_transform_is_absolute() {
        let mut m = model();
        m.apply_operation(&record(
            OpKind::SetTransform,
            "slab-1",
            json!({ "position": [5.0, 5.0, 0.0], "rotation": [0.0, 0.5, 0.0] }),
        ))
        .unwrap();
        let slab = m.element(&"slab-1".into()).unwrap();
        assert_eq!(slab.position, [5.0, 5.0, 0.0]);
        assert_eq!(slab.rotation, [0.0, 0.5, 0.0]);
    }

    #[test]
    fn test_missing_target_reported() {
        let mut m = model();
        let err = m
            .apply_operation(&record(OpKind::Translate, "ghost", json!({ "dx": 1.0 })))
            .unwrap_err();
        assert!(matches!(err, ReplayError::TargetMissing { .. }));
    }

    #[test]
    fn test_invalid_payload_leaves_element_intact() {
        let mut m = model();
        let before = m.element(&"slab-1".into()).unwrap().clone();
        let err = m
            .apply_operation(&record(
                OpKind::EditGeometry,
                "slab-1",
                json!({ "geometry": { "profiles": "not-a-map" } }),
            ))
            .unwrap_err();
        assert!(matches!(err, ReplayError::InvalidPayload { .. }));
        assert_eq!(m.element(&"slab-1".into()).unwrap(), &before);
    }

    #[test]
    fn test_edit_geometry_replaces_given_collections() {
        let mut m = model();
        m.apply_operation(&record(
            OpKind::EditGeometry,
            "slab-1",
            json!({ "geometry": { "holes": { "7": [1, 2] } } }),
        ))
        .unwrap();
        let geometry = &m.element(&"slab-1".into()).unwrap().geometry;
        assert_eq!(geometry.holes.get("7"), Some(&json!([1, 2])));
        assert!(geometry.profiles.is_empty());
    }

    #[test]
    fn test_override_with_cube() {
        let mut m = model();
        m.apply_operation(&record(
            OpKind::OverrideGeometry,
            "wall-12",
            json!({ "shape": "cube", "size": 1.0 }),
        ))
        .unwrap();
        let geometry = &m.element(&"wall-12".into()).unwrap().geometry;
        assert_eq!(geometry.primitive.as_ref().unwrap()["shape"], "cube");
    }

    #[test]
    fn test_unknown_primitive_unsupported() {
        let mut m = model();
        let err = m
            .apply_operation(&record(
                OpKind::OverrideGeometry,
                "wall-12",
                json!({ "shape": "torus" }),
            ))
            .unwrap_err();
        assert_eq!(err, ReplayError::Unsupported { kind: OpKind::OverrideGeometry });
    }

    #[test]
    fn test_delete_removes_element() {
        let mut m = model();
        m.apply_operation(&record(OpKind::Delete, "slab-1", json!({}))).unwrap();
        assert!(m.element(&"slab-1".into()).is_none());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_apply_keeps_hidden_element_hidden() {
        let mut m = model();
        m.set_visible(&"wall-12".into(), false).unwrap();
        m.apply_operation(&record(OpKind::SetMaterial, "wall-12", json!({ "material": "glass" })))
            .unwrap();
        let wall = m.element(&"wall-12".into()).unwrap();
        assert!(!wall.visible);
        assert_eq!(wall.material.as_deref(), Some("glass"));
    }

    #[test]
    fn test_update_samples_replaces_map() {
        let mut m = model();
        let set = |samples| record(OpKind::UpdateSamples, "slab-1", json!({ "samples": samples }));
        m.apply_operation(&set(json!({ "s1": 1, "s2": 2 }))).unwrap();
        m.apply_operation(&set(json!({ "s2": 3 }))).unwrap();

        let samples = &m.element(&"slab-1".into()).unwrap().samples;
        assert_eq!(samples.len(), 1);
        assert_eq!(samples.get("s2"), Some(&json!(3)));
    }

    #[test]
    fn test_digest_ignores_visibility() {
        let mut a = model();
        let b = model();
        a.set_visible(&"slab-1".into(), false).unwrap();
        assert_eq!(a.state_digest(), b.state_digest());
    }

    #[test]
    fn test_snapshot_roundtrip_through_engine() {
        let bytes = model().to_snapshot().unwrap();
        let loaded = SceneEngine.load_model(&ModelId::from("m"), &bytes).unwrap();
        assert_eq!(loaded.state_digest(), model().state_digest());
    }

    #[test]
    fn test_load_errors() {
        let id = ModelId::from("m");
        assert_eq!(SceneEngine.load_model(&id, b"").unwrap_err(), ModelLoadError::Empty);
        assert!(matches!(
            SceneEngine.load_model(&id, b"{not json").unwrap_err(),
            ModelLoadError::Corrupt(_)
        ));
    }
}
