//! Schema drift reports.
//!
//! Produced by comparing code-side descriptors against stored schemas;
//! carried inside `EngineError::SchemaOutdated` and by migration previews.

use serde::{Deserialize, Serialize};

use crate::descriptor::{RecordKind, TypeDescriptor};
use crate::spec::{TypeSpec, synthesize_legacy};

/// A changed field: same name, different canonical spec.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    /// Canonical JSON of the stored spec (or the raw legacy string when
    /// synthesis failed).
    pub stored: String,
    /// Canonical JSON of the code-side spec.
    pub current: String,
}

/// Drift for one type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeDrift {
    pub kind: Option<RecordKind>,
    pub type_name: String,
    /// Version currently stored, if the type is registered at all.
    pub stored_version: Option<i64>,
    /// Fields present in code but not stored.
    pub added: Vec<String>,
    /// Fields stored but no longer declared.
    pub removed: Vec<String>,
    /// Fields whose spec changed.
    pub changed: Vec<FieldChange>,
}

impl TypeDrift {
    /// Whether this type actually drifted.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Drift across all compared types.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDrift {
    pub types: Vec<TypeDrift>,
}

impl SchemaDrift {
    pub fn is_empty(&self) -> bool {
        self.types.iter().all(TypeDrift::is_empty)
    }

    /// Keeps only types that drifted.
    pub fn retain_changed(mut self) -> Self {
        self.types.retain(|t| !t.is_empty());
        self
    }
}

impl std::fmt::Display for SchemaDrift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for t in self.types.iter().filter(|t| !t.is_empty()) {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{}(", t.type_name)?;
            let mut parts = Vec::new();
            if !t.added.is_empty() {
                parts.push(format!("added: {}", t.added.join(", ")));
            }
            if !t.removed.is_empty() {
                parts.push(format!("removed: {}", t.removed.join(", ")));
            }
            if !t.changed.is_empty() {
                let names: Vec<&str> = t.changed.iter().map(|c| c.field.as_str()).collect();
                parts.push(format!("changed: {}", names.join(", ")));
            }
            write!(f, "{})", parts.join("; "))?;
        }
        if first {
            write!(f, "no drift")?;
        }
        Ok(())
    }
}

/// The stored side of a drift comparison: a field's spec as persisted,
/// either canonical JSON or a legacy type string.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredFieldSpec {
    /// Canonical structured spec.
    Spec(TypeSpec),
    /// Legacy string form; synthesised through the bounded grammar.
    Legacy(String),
}

impl StoredFieldSpec {
    /// Resolves to a canonical spec, if possible.
    pub fn resolve(&self) -> Option<TypeSpec> {
        match self {
            StoredFieldSpec::Spec(spec) => Some(spec.clone()),
            StoredFieldSpec::Legacy(raw) => synthesize_legacy(raw),
        }
    }

    fn display_form(&self) -> String {
        match self {
            StoredFieldSpec::Spec(spec) => spec.canonical_json(),
            StoredFieldSpec::Legacy(raw) => raw.clone(),
        }
    }
}

/// Computes drift between the code-side descriptor and a stored
/// descriptor. A stored field whose legacy spec cannot be synthesised is
/// reported as changed (synthesis failure implies drift).
pub fn diff_descriptor(
    current: &TypeDescriptor,
    stored: &TypeDescriptor,
    stored_version: Option<i64>,
) -> TypeDrift {
    let mut drift = TypeDrift {
        kind: Some(current.kind),
        type_name: current.name.clone(),
        stored_version,
        ..TypeDrift::default()
    };

    for field in &current.fields {
        match stored.field(&field.name) {
            None => drift.added.push(field.name.clone()),
            Some(stored_field) => {
                if !field.spec.structurally_equal(&stored_field.spec) {
                    drift.changed.push(FieldChange {
                        field: field.name.clone(),
                        stored: stored_field.spec.canonical_json(),
                        current: field.spec.canonical_json(),
                    });
                }
            }
        }
    }
    for field in &stored.fields {
        if current.field(&field.name).is_none() {
            drift.removed.push(field.name.clone());
        }
    }
    drift
}

/// Like [`diff_descriptor`] but against a loose stored field map (name to
/// [`StoredFieldSpec`]), the shape legacy registries persist.
pub fn diff_against_stored_fields(
    current: &TypeDescriptor,
    stored_fields: &[(String, StoredFieldSpec)],
    stored_version: Option<i64>,
) -> TypeDrift {
    let mut drift = TypeDrift {
        kind: Some(current.kind),
        type_name: current.name.clone(),
        stored_version,
        ..TypeDrift::default()
    };

    for field in &current.fields {
        match stored_fields.iter().find(|(n, _)| n == &field.name) {
            None => drift.added.push(field.name.clone()),
            Some((_, stored_spec)) => match stored_spec.resolve() {
                Some(resolved) if field.spec.structurally_equal(&resolved) => {}
                _ => drift.changed.push(FieldChange {
                    field: field.name.clone(),
                    stored: stored_spec.display_form(),
                    current: field.spec.canonical_json(),
                }),
            },
        }
    }
    for (name, _) in stored_fields {
        if current.field(name).is_none() {
            drift.removed.push(name.clone());
        }
    }
    drift
}
