//! Declared intents: desired state for one identity.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::descriptor::{RecordKind, TypeDescriptor};
use crate::error::{EngineError, Result};
use crate::identity::Identity;

/// A typed entity value storable through a session.
///
/// Implementations pair a serde-serialisable struct with its registered
/// [`TypeDescriptor`]. The descriptor's primary-key field must match what
/// [`EntityType::key`] returns.
pub trait EntityType: Serialize + DeserializeOwned {
    /// Type name, unique among entities.
    const NAME: &'static str;

    /// The registered descriptor for this type.
    fn descriptor() -> TypeDescriptor;

    /// Primary key of this instance.
    fn key(&self) -> String;
}

/// A typed relation value storable through a session.
pub trait RelationType: Serialize + DeserializeOwned {
    /// Type name, unique among relations.
    const NAME: &'static str;

    /// Left endpoint entity type.
    type Left: EntityType;
    /// Right endpoint entity type.
    type Right: EntityType;

    /// The registered descriptor for this type.
    fn descriptor() -> TypeDescriptor;

    /// Left endpoint key of this instance.
    fn left_key(&self) -> String;

    /// Right endpoint key of this instance.
    fn right_key(&self) -> String;

    /// Instance key; `None` for unkeyed relation types.
    fn instance_key(&self) -> Option<String> {
        None
    }
}

/// A declarative statement of expected state for one identity.
#[derive(Clone, Debug)]
pub struct Intent {
    pub kind: RecordKind,
    pub type_name: String,
    pub identity: Identity,
    /// Canonical payload: declared payload fields only, defaults applied.
    pub payload: Value,
}

impl Intent {
    /// Builds an intent from a typed entity value, validating the payload
    /// against the descriptor.
    pub fn from_entity<E: EntityType>(value: &E) -> Result<Self> {
        let descriptor = E::descriptor();
        if descriptor.kind != RecordKind::Entity {
            return Err(EngineError::validation(format!(
                "{} is not registered as an entity",
                E::NAME
            )));
        }
        let record = serde_json::to_value(value)?;
        let (_, payload) = descriptor.split_payload(record)?;
        Ok(Intent {
            kind: RecordKind::Entity,
            type_name: E::NAME.to_string(),
            identity: Identity::entity(value.key())?,
            payload,
        })
    }

    /// Builds an intent from a typed relation value.
    pub fn from_relation<R: RelationType>(value: &R) -> Result<Self> {
        let descriptor = R::descriptor();
        if descriptor.kind != RecordKind::Relation {
            return Err(EngineError::validation(format!(
                "{} is not registered as a relation",
                R::NAME
            )));
        }
        let record = serde_json::to_value(value)?;
        let (_, payload) = descriptor.split_payload(record)?;
        let declared_keyed = descriptor.instance_key_field().is_some();
        let instance_key = value.instance_key();
        if declared_keyed && instance_key.is_none() {
            return Err(EngineError::validation(format!(
                "relation {} declares an instance key; a value is required",
                R::NAME
            )));
        }
        if !declared_keyed && instance_key.is_some() {
            return Err(EngineError::validation(format!(
                "relation {} is unkeyed; instance keys are not accepted",
                R::NAME
            )));
        }
        Ok(Intent {
            kind: RecordKind::Relation,
            type_name: R::NAME.to_string(),
            identity: Identity::relation(value.left_key(), value.right_key(), instance_key)?,
            payload,
        })
    }
}
