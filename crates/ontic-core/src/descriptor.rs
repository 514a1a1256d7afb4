//! Runtime type descriptors for entities and relations.
//!
//! A [`TypeDescriptor`] is the registered, serialisable description of one
//! entity or relation type: its fields, their canonical [`TypeSpec`]s and
//! the identity roles (primary key, endpoints, instance key). Descriptors
//! are what the schema registry stores and what drift detection compares.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::spec::TypeSpec;

/// Whether a record type is an entity or a relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Entity,
    Relation,
}

impl RecordKind {
    /// Stable lowercase name used in table names and object paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Entity => "entity",
            RecordKind::Relation => "relation",
        }
    }
}

/// One declared field of an entity or relation type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldDef {
    /// Field name; must match the path-segment grammar.
    pub name: String,
    /// Canonical type of the field.
    pub spec: TypeSpec,
    /// Entity primary key flag (exactly one per entity, `str`-typed).
    #[serde(default)]
    pub primary_key: bool,
    /// Relation instance-key flag (at most one per relation, `str`-typed).
    #[serde(default)]
    pub instance_key: bool,
    /// Request a storage index for this field.
    #[serde(default)]
    pub index: bool,
    /// Default value applied when an intent omits the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldDef {
    fn new(name: impl Into<String>, spec: TypeSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            primary_key: false,
            instance_key: false,
            index: false,
            default: None,
        }
    }
}

/// One endpoint of a relation type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointDef {
    /// Entity type the endpoint targets.
    pub type_name: String,
    /// Field on the relation holding the endpoint key.
    pub key_field: String,
}

/// Registered description of one entity or relation type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypeDescriptor {
    /// Type name, unique per kind.
    pub name: String,
    /// Entity or relation.
    pub kind: RecordKind,
    /// Declared fields in declaration order.
    pub fields: Vec<FieldDef>,
    /// Left endpoint (relations only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<EndpointDef>,
    /// Right endpoint (relations only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<EndpointDef>,
}

impl TypeDescriptor {
    /// Starts a builder for an entity type.
    pub fn entity(name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            name: name.into(),
            kind: RecordKind::Entity,
            fields: Vec::new(),
            left: None,
            right: None,
        }
    }

    /// Starts a builder for a relation type.
    pub fn relation(name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            name: name.into(),
            kind: RecordKind::Relation,
            fields: Vec::new(),
            left: None,
            right: None,
        }
    }

    // -- Accessors -----------------------------------------------------------

    /// The declared field with the given name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The entity primary-key field name.
    pub fn primary_key_field(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.primary_key)
            .map(|f| f.name.as_str())
    }

    /// The relation instance-key field name, if declared.
    pub fn instance_key_field(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.instance_key)
            .map(|f| f.name.as_str())
    }

    /// Field names that form the identity (and are therefore excluded from
    /// the persisted payload).
    pub fn identity_fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(pk) = self.primary_key_field() {
            out.push(pk);
        }
        if let Some(l) = &self.left {
            out.push(l.key_field.as_str());
        }
        if let Some(r) = &self.right {
            out.push(r.key_field.as_str());
        }
        if let Some(ik) = self.instance_key_field() {
            out.push(ik);
        }
        out
    }

    /// Payload fields: declared fields minus identity fields.
    pub fn payload_fields(&self) -> impl Iterator<Item = &FieldDef> {
        let identity: Vec<String> = self
            .identity_fields()
            .into_iter()
            .map(str::to_string)
            .collect();
        self.fields
            .iter()
            .filter(move |f| !identity.contains(&f.name))
    }

    /// Canonical JSON of the descriptor, the registry storage form.
    pub fn to_registry_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parses a descriptor from its registry storage form.
    pub fn from_registry_json(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    // -- Payload handling ----------------------------------------------------

    /// Splits a serialised record into `(identity field values, payload)`,
    /// applying declared defaults for omitted payload fields and rejecting
    /// keys that are not declared.
    pub fn split_payload(&self, mut record: Value) -> Result<(Value, Value)> {
        let map = record.as_object_mut().ok_or_else(|| {
            EngineError::validation(format!("{} record must serialise to an object", self.name))
        })?;

        for key in map.keys() {
            if self.field(key).is_none() {
                return Err(EngineError::validation(format!(
                    "unknown field `{}` on type {}",
                    key, self.name
                )));
            }
        }

        let mut identity = serde_json::Map::new();
        for name in self.identity_fields() {
            match map.remove(name) {
                Some(v) => {
                    identity.insert(name.to_string(), v);
                }
                None => {
                    return Err(EngineError::validation(format!(
                        "missing identity field `{}` on type {}",
                        name, self.name
                    )));
                }
            }
        }

        for field in self.payload_fields() {
            if !map.contains_key(&field.name) {
                let value = field.default.clone().unwrap_or(Value::Null);
                map.insert(field.name.clone(), value);
            }
        }

        Ok((Value::Object(identity), record))
    }
}

/// Builder for [`TypeDescriptor`]; `build` validates the identity rules.
pub struct DescriptorBuilder {
    name: String,
    kind: RecordKind,
    fields: Vec<FieldDef>,
    left: Option<EndpointDef>,
    right: Option<EndpointDef>,
}

impl DescriptorBuilder {
    /// Declares the entity primary key (always `str`-typed).
    pub fn primary_key(mut self, name: impl Into<String>) -> Self {
        let mut field = FieldDef::new(name, TypeSpec::str());
        field.primary_key = true;
        self.fields.push(field);
        self
    }

    /// Declares the left endpoint of a relation.
    pub fn left(mut self, type_name: impl Into<String>, key_field: impl Into<String>) -> Self {
        let key_field = key_field.into();
        self.fields.push(FieldDef::new(&key_field, TypeSpec::str()));
        self.left = Some(EndpointDef {
            type_name: type_name.into(),
            key_field,
        });
        self
    }

    /// Declares the right endpoint of a relation.
    pub fn right(mut self, type_name: impl Into<String>, key_field: impl Into<String>) -> Self {
        let key_field = key_field.into();
        self.fields.push(FieldDef::new(&key_field, TypeSpec::str()));
        self.right = Some(EndpointDef {
            type_name: type_name.into(),
            key_field,
        });
        self
    }

    /// Declares the relation instance key (required `str`, non-empty at
    /// intent time).
    pub fn instance_key(mut self, name: impl Into<String>) -> Self {
        let mut field = FieldDef::new(name, TypeSpec::str());
        field.instance_key = true;
        self.fields.push(field);
        self
    }

    /// Declares a payload field.
    pub fn field(mut self, name: impl Into<String>, spec: TypeSpec) -> Self {
        self.fields.push(FieldDef::new(name, spec));
        self
    }

    /// Declares an indexed payload field.
    pub fn indexed_field(mut self, name: impl Into<String>, spec: TypeSpec) -> Self {
        let mut field = FieldDef::new(name, spec);
        field.index = true;
        self.fields.push(field);
        self
    }

    /// Declares a payload field with a default value.
    pub fn field_with_default(
        mut self,
        name: impl Into<String>,
        spec: TypeSpec,
        default: Value,
    ) -> Self {
        let mut field = FieldDef::new(name, spec);
        field.default = Some(default);
        self.fields.push(field);
        self
    }

    /// Validates the declaration and produces the descriptor.
    pub fn build(self) -> Result<TypeDescriptor> {
        if !crate::filter::is_valid_segment(&self.name) {
            return Err(EngineError::validation(format!(
                "type name `{}` is not a valid identifier",
                self.name
            )));
        }
        for field in &self.fields {
            if !crate::filter::is_valid_segment(&field.name) {
                return Err(EngineError::validation(format!(
                    "field name `{}` on {} is not a valid identifier",
                    field.name, self.name
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(EngineError::validation(format!(
                    "duplicate field `{}` on {}",
                    field.name, self.name
                )));
            }
        }

        let pk_count = self.fields.iter().filter(|f| f.primary_key).count();
        let ik_count = self.fields.iter().filter(|f| f.instance_key).count();

        match self.kind {
            RecordKind::Entity => {
                if pk_count != 1 {
                    return Err(EngineError::validation(format!(
                        "entity {} must declare exactly one primary key",
                        self.name
                    )));
                }
                if ik_count > 0 || self.left.is_some() || self.right.is_some() {
                    return Err(EngineError::validation(format!(
                        "entity {} cannot declare relation identity fields",
                        self.name
                    )));
                }
            }
            RecordKind::Relation => {
                if pk_count > 0 {
                    return Err(EngineError::validation(format!(
                        "relation {} cannot declare a primary key",
                        self.name
                    )));
                }
                if self.left.is_none() || self.right.is_none() {
                    return Err(EngineError::validation(format!(
                        "relation {} must declare both endpoints",
                        self.name
                    )));
                }
                if ik_count > 1 {
                    return Err(EngineError::validation(format!(
                        "relation {} declares more than one instance key",
                        self.name
                    )));
                }
            }
        }

        Ok(TypeDescriptor {
            name: self.name,
            kind: self.kind,
            fields: self.fields,
            left: self.left,
            right: self.right,
        })
    }
}
