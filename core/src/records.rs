//! The record data model (spec.md §3 and §3.1 of SPEC_FULL.md): a mapping
//! from record-id to loosely-typed JSON record, discriminated by `typeName`
//! and (for shapes/bindings/assets) an inner `type` tag.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::SyncError;

/// The closed set of `typeName` values a record may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeName {
    Document,
    Page,
    Shape,
    Binding,
    Asset,
    Camera,
    Instance,
    InstancePageState,
    InstancePresence,
    Pointer,
}

impl TypeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeName::Document => "document",
            TypeName::Page => "page",
            TypeName::Shape => "shape",
            TypeName::Binding => "binding",
            TypeName::Asset => "asset",
            TypeName::Camera => "camera",
            TypeName::Instance => "instance",
            TypeName::InstancePageState => "instance_page_state",
            TypeName::InstancePresence => "instance_presence",
            TypeName::Pointer => "pointer",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "document" => TypeName::Document,
            "page" => TypeName::Page,
            "shape" => TypeName::Shape,
            "binding" => TypeName::Binding,
            "asset" => TypeName::Asset,
            "camera" => TypeName::Camera,
            "instance" => TypeName::Instance,
            "instance_page_state" => TypeName::InstancePageState,
            "instance_presence" => TypeName::InstancePresence,
            "pointer" => TypeName::Pointer,
            _ => return None,
        })
    }

    /// The scope partition this type belongs to (spec.md §3 "Records are
    /// partitioned by scope").
    pub fn scope(&self) -> Scope {
        match self {
            TypeName::Document
            | TypeName::Page
            | TypeName::Shape
            | TypeName::Binding
            | TypeName::Asset => Scope::Document,
            TypeName::InstancePresence => Scope::Presence,
            TypeName::Camera
            | TypeName::Instance
            | TypeName::InstancePageState
            | TypeName::Pointer => Scope::Session,
        }
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three record scopes (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Shared, persisted, replicated, part of the snapshot.
    Document,
    /// Ephemeral per-session, broadcast but never persisted or authoritative.
    Presence,
    /// Purely client-local; the server never touches these.
    Session,
}

/// A record-id: `"<typeName>:<opaque-unique-part>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(type_name: TypeName, unique_part: impl AsRef<str>) -> Self {
        Self(format!("{}:{}", type_name.as_str(), unique_part.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `typeName` prefix of this id, if it matches the closed set.
    pub fn type_name(&self) -> Option<TypeName> {
        let (prefix, _) = self.0.split_once(':')?;
        TypeName::from_str(prefix)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A record: a JSON object that carries at least `id` and `typeName`.
/// Modeled as a thin wrapper over `serde_json::Map` rather than a static
/// struct-per-variant, per the "JSON value + per-type validator" design note
/// in spec.md §9 — the number of shape/binding/asset inner variants makes a
/// static type for every one of them more ceremony than value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Map<String, Value>);

impl Record {
    pub fn id(&self) -> Option<RecordId> {
        self.0.get("id")?.as_str().map(RecordId::from)
    }

    pub fn type_name(&self) -> Option<TypeName> {
        self.0.get("typeName")?.as_str().and_then(TypeName::from_str)
    }

    /// The inner `type` tag used by shapes/bindings/assets, if present.
    pub fn inner_type(&self) -> Option<&str> {
        self.0.get("type")?.as_str()
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Record(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// `record.id` begins with `record.typeName + ":"` (spec.md §3 invariant).
pub fn validate_id_matches_type(record: &Record) -> Result<(), SyncError> {
    let id = record.id().ok_or_else(|| SyncError::InvalidRecord {
        record_id: "<missing id>".into(),
        reason: "record has no id field".into(),
    })?;
    let type_name = record.type_name().ok_or_else(|| SyncError::InvalidRecord {
        record_id: id.to_string(),
        reason: "record has no typeName field".into(),
    })?;
    let expected_prefix = format!("{}:", type_name.as_str());
    if !id.as_str().starts_with(&expected_prefix) {
        return Err(SyncError::InvalidRecord {
            record_id: id.to_string(),
            reason: format!(
                "id does not begin with its typeName ({}, expected prefix {})",
                type_name, expected_prefix
            ),
        });
    }
    Ok(())
}

/// Validates a record's shape against the concrete catalogue in
/// SPEC_FULL.md §3.1. Called after up-migration (spec.md §4.3 "after
/// up-migration, every record is validated against the server's record-type
/// validator").
pub fn validate_record(record: &Record) -> Result<(), SyncError> {
    validate_id_matches_type(record)?;
    let id = record.id().expect("checked above");
    let type_name = record.type_name().expect("checked above");

    let require = |key: &str| -> Result<(), SyncError> {
        if record.get(key).is_none() {
            return Err(SyncError::InvalidRecord {
                record_id: id.to_string(),
                reason: format!("missing required field `{key}`"),
            });
        }
        Ok(())
    };

    match type_name {
        TypeName::Document => {
            require("gridSize")?;
            require("name")?;
            require("version")?;
        }
        TypeName::Page => {
            require("name")?;
            require("index")?;
        }
        TypeName::Shape => {
            require("parentId")?;
            require("index")?;
            require("x")?;
            require("y")?;
            require("rotation")?;
            require("props")?;
            match record.inner_type() {
                Some("geo") | Some("arrow") | Some("note") => {}
                Some(other) => {
                    return Err(SyncError::InvalidRecord {
                        record_id: id.to_string(),
                        reason: format!("unknown shape type `{other}`"),
                    });
                }
                None => {
                    return Err(SyncError::InvalidRecord {
                        record_id: id.to_string(),
                        reason: "shape record missing inner `type` tag".into(),
                    });
                }
            }
        }
        TypeName::Binding => {
            require("fromId")?;
            require("toId")?;
            require("props")?;
            if !matches!(record.inner_type(), Some("arrow")) {
                return Err(SyncError::InvalidRecord {
                    record_id: id.to_string(),
                    reason: format!("unknown binding type `{:?}`", record.inner_type()),
                });
            }
        }
        TypeName::Asset => {
            require("props")?;
            if !matches!(record.inner_type(), Some("image")) {
                return Err(SyncError::InvalidRecord {
                    record_id: id.to_string(),
                    reason: format!("unknown asset type `{:?}`", record.inner_type()),
                });
            }
        }
        TypeName::Camera | TypeName::Instance | TypeName::InstancePageState | TypeName::Pointer => {
            return Err(SyncError::InvalidOperation {
                reason: format!(
                    "{id} is session-scoped and must never reach the server's document map"
                ),
            });
        }
        TypeName::InstancePresence => {
            require("userId")?;
            require("cursor")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shape(id: &str) -> Record {
        Record::from_value(json!({
            "id": id,
            "typeName": "shape",
            "type": "geo",
            "parentId": "page:main",
            "index": "a1",
            "x": 0.0,
            "y": 0.0,
            "rotation": 0.0,
            "props": { "w": 100, "h": 100, "geo": "rectangle", "color": "black", "fill": "none" },
        }))
        .unwrap()
    }

    #[test]
    fn id_prefix_must_match_type_name() {
        let bad = Record::from_value(json!({
            "id": "page:x1",
            "typeName": "shape",
            "type": "geo",
        }))
        .unwrap();
        assert!(validate_id_matches_type(&bad).is_err());
    }

    #[test]
    fn valid_geo_shape_passes() {
        assert!(validate_record(&shape("shape:x1")).is_ok());
    }

    #[test]
    fn session_scope_record_is_rejected() {
        let camera = Record::from_value(json!({
            "id": "camera:page1",
            "typeName": "camera",
            "x": 0, "y": 0, "z": 1,
        }))
        .unwrap();
        assert!(matches!(
            validate_record(&camera),
            Err(SyncError::InvalidOperation { .. })
        ));
    }

    #[test]
    fn unknown_inner_shape_type_is_rejected() {
        let bad = Record::from_value(json!({
            "id": "shape:x1",
            "typeName": "shape",
            "type": "triangle",
            "parentId": "page:main",
            "index": "a1",
            "x": 0, "y": 0, "rotation": 0,
            "props": {},
        }))
        .unwrap();
        assert!(validate_record(&bad).is_err());
    }
}
