//! Record identities.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// The tuple that uniquely names a record for upsert/version purposes.
///
/// Unkeyed relations store the empty-string sentinel as their instance
/// key; user-supplied empty instance keys are rejected at intent time.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    Entity {
        key: String,
    },
    Relation {
        left_key: String,
        right_key: String,
        /// `""` for unkeyed relations.
        instance_key: String,
    },
}

impl Identity {
    /// Entity identity.
    pub fn entity(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(EngineError::validation("entity key must not be empty"));
        }
        Ok(Identity::Entity { key })
    }

    /// Relation identity; `instance_key = None` means unkeyed.
    pub fn relation(
        left_key: impl Into<String>,
        right_key: impl Into<String>,
        instance_key: Option<String>,
    ) -> Result<Self> {
        let left_key = left_key.into();
        let right_key = right_key.into();
        if left_key.is_empty() || right_key.is_empty() {
            return Err(EngineError::validation(
                "relation endpoint keys must not be empty",
            ));
        }
        if let Some(ik) = &instance_key {
            if ik.is_empty() {
                return Err(EngineError::validation(
                    "instance key must not be empty; omit it for unkeyed relations",
                ));
            }
        }
        Ok(Identity::Relation {
            left_key,
            right_key,
            instance_key: instance_key.unwrap_or_default(),
        })
    }

    /// A stable single-string form used for per-identity partitioning and
    /// deterministic ordering. Components are joined with `\x1f`, which the
    /// key grammar cannot contain.
    pub fn storage_key(&self) -> String {
        match self {
            Identity::Entity { key } => key.clone(),
            Identity::Relation {
                left_key,
                right_key,
                instance_key,
            } => format!("{left_key}\u{1f}{right_key}\u{1f}{instance_key}"),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::Entity { key } => write!(f, "{key}"),
            Identity::Relation {
                left_key,
                right_key,
                instance_key,
            } => {
                if instance_key.is_empty() {
                    write!(f, "{left_key}->{right_key}")
                } else {
                    write!(f, "{left_key}->{right_key}#{instance_key}")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_instance_key_rejected() {
        let err = Identity::relation("l", "r", Some(String::new())).unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[test]
    fn unkeyed_relation_uses_sentinel() {
        let id = Identity::relation("l", "r", None).unwrap();
        assert_eq!(
            id,
            Identity::Relation {
                left_key: "l".into(),
                right_key: "r".into(),
                instance_key: String::new(),
            }
        );
    }

    #[test]
    fn keyed_relations_are_distinct_identities() {
        let a = Identity::relation("p1", "c1", Some("a".into())).unwrap();
        let b = Identity::relation("p1", "c1", Some("b".into())).unwrap();
        assert_ne!(a, b);
        assert_ne!(a.storage_key(), b.storage_key());
    }
}
