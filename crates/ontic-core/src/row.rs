//! Stored rows: immutable materialisations of an identity's state.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::{RecordKind, TypeDescriptor};
use crate::error::{EngineError, Result};
use crate::identity::Identity;

/// One immutable history row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredRow {
    pub kind: RecordKind,
    pub type_name: String,
    pub identity: Identity,
    /// Payload fields (identity fields excluded).
    pub fields: Value,
    /// Commit that produced this row.
    pub commit_id: u64,
    /// Schema version the row was written under.
    pub schema_version_id: i64,
}

impl StoredRow {
    /// A merged object view (identity fields + payload), the shape
    /// predicates evaluate against and typed values decode from.
    pub fn view(&self, descriptor: &TypeDescriptor) -> Value {
        let mut map = match &self.fields {
            Value::Object(m) => m.clone(),
            _ => serde_json::Map::new(),
        };
        match &self.identity {
            Identity::Entity { key } => {
                if let Some(pk) = descriptor.primary_key_field() {
                    map.insert(pk.to_string(), Value::String(key.clone()));
                }
            }
            Identity::Relation {
                left_key,
                right_key,
                instance_key,
            } => {
                if let Some(l) = &descriptor.left {
                    map.insert(l.key_field.clone(), Value::String(left_key.clone()));
                }
                if let Some(r) = &descriptor.right {
                    map.insert(r.key_field.clone(), Value::String(right_key.clone()));
                }
                if let Some(ik) = descriptor.instance_key_field() {
                    if !instance_key.is_empty() {
                        map.insert(ik.to_string(), Value::String(instance_key.clone()));
                    }
                }
            }
        }
        Value::Object(map)
    }

    /// Decodes the row into a typed value via the merged view.
    pub fn decode<T: DeserializeOwned>(&self, descriptor: &TypeDescriptor) -> Result<T> {
        serde_json::from_value(self.view(descriptor)).map_err(EngineError::from)
    }
}
