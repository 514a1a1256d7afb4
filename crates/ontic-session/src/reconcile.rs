//! Delta reconciliation: declared intents against current state.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use ontic_core::canonical::canonical_eq;
use ontic_core::commit::{ChangeOp, ChangeRecord, ChangeWrite};
use ontic_core::descriptor::TypeDescriptor;
use ontic_core::error::{EngineError, Result};
use ontic_core::filter::{CompareOp, Comparison, FieldPath, Filter, Operand};
use ontic_core::identity::Identity;
use ontic_core::intent::Intent;
use ontic_core::query::QueryRequest;
use ontic_storage::Repository;

/// Reconciles an ordered batch of intents into change records.
///
/// Within a batch, a later intent for the same identity overrides the
/// earlier one (no change is produced for superseded intermediates).
/// Unchanged payloads (canonical JSON equality) produce no change at
/// all; everything else becomes an insert or an appended version.
pub fn reconcile(
    repo: &dyn Repository,
    descriptors: &BTreeMap<String, TypeDescriptor>,
    versions: &BTreeMap<String, i64>,
    intents: Vec<Intent>,
    max_batch_size: usize,
) -> Result<Vec<ChangeWrite>> {
    // Group by identity, first-seen order, later intents override.
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, Intent> = HashMap::new();
    for intent in intents {
        let key = format!("{}\u{1f}{}", intent.type_name, intent.identity.storage_key());
        if !merged.contains_key(&key) {
            order.push(key.clone());
        }
        merged.insert(key, intent);
    }

    let mut changes = Vec::new();
    for key in order {
        let intent = merged.remove(&key).expect("merged intent");
        let descriptor = descriptors.get(&intent.type_name).ok_or_else(|| {
            EngineError::validation(format!(
                "type {} is not registered with this session",
                intent.type_name
            ))
        })?;
        let version = versions.get(&intent.type_name).copied().ok_or_else(|| {
            EngineError::metadata(format!(
                "no current schema version for {}; validate the session first",
                intent.type_name
            ))
        })?;

        let current = current_row(repo, descriptor, version, &intent)?;
        let operation = match &current {
            None => ChangeOp::Insert,
            Some(existing) if canonical_eq(&existing.fields, &intent.payload) => {
                debug!(type_name = %intent.type_name, identity = %intent.identity, "no-op intent");
                continue;
            }
            Some(_) => ChangeOp::UpdateVersion,
        };

        changes.push(ChangeWrite {
            record: ChangeRecord {
                kind: intent.kind,
                type_name: intent.type_name.clone(),
                identity: intent.identity.clone(),
                operation,
            },
            payload: intent.payload,
            schema_version_id: version,
        });
    }

    if changes.len() > max_batch_size {
        return Err(EngineError::BatchSizeExceeded {
            size: changes.len(),
            limit: max_batch_size,
        });
    }
    Ok(changes)
}

/// Looks up the current row for an intent's identity.
fn current_row(
    repo: &dyn Repository,
    descriptor: &TypeDescriptor,
    version: i64,
    intent: &Intent,
) -> Result<Option<ontic_core::row::StoredRow>> {
    let mut request = QueryRequest::latest(descriptor.clone());
    request.schema_version = version;
    request.filter = Some(identity_filter(descriptor, &intent.identity)?);
    request.limit = Some(1);
    Ok(repo.query_rows(&request)?.into_iter().next())
}

/// Builds a predicate pinning an exact identity.
fn identity_filter(descriptor: &TypeDescriptor, identity: &Identity) -> Result<Filter> {
    fn eq(field: &str, value: &str) -> Result<Filter> {
        Ok(Filter::Compare(Comparison {
            path: FieldPath::root(field)?,
            op: CompareOp::Eq,
            operand: Operand::Scalar(value.into()),
        }))
    }
    match identity {
        Identity::Entity { key } => {
            let pk = descriptor.primary_key_field().ok_or_else(|| {
                EngineError::validation(format!("{} has no primary key", descriptor.name))
            })?;
            eq(pk, key)
        }
        Identity::Relation {
            left_key,
            right_key,
            instance_key,
        } => {
            let left = descriptor.left.as_ref().ok_or_else(|| {
                EngineError::validation(format!("{} has no left endpoint", descriptor.name))
            })?;
            let right = descriptor.right.as_ref().ok_or_else(|| {
                EngineError::validation(format!("{} has no right endpoint", descriptor.name))
            })?;
            let mut filter = eq(&left.key_field, left_key)? & eq(&right.key_field, right_key)?;
            if let Some(ik_field) = descriptor.instance_key_field() {
                filter = filter & eq(ik_field, instance_key)?;
            }
            Ok(filter)
        }
    }
}
