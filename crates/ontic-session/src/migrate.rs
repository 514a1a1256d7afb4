//! Migration planner and executor.
//!
//! Preview computes the per-type drift, row counts and upgrader
//! requirements and returns a plan token; apply recomputes the plan
//! under the write lease, verifies the token, upgrades current-state
//! rows through the registered upgrader chain and persists one
//! migration commit activating the new schema versions.

use std::collections::{BTreeMap, HashMap};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use tracing::{debug, info};

use ontic_core::canonical::{sha256_hex, to_canonical_json};
use ontic_core::commit::{ChangeOp, ChangeRecord, ChangeWrite, CommitDraft, SchemaActivation};
use ontic_core::descriptor::TypeDescriptor;
use ontic_core::drift::{SchemaDrift, TypeDrift, diff_against_stored_fields};
use ontic_core::error::{EngineError, Result};
use ontic_core::query::QueryRequest;
use ontic_storage::Repository;

use crate::session::{Session, schema_hash};

/// Row-level upgraders keyed by `(type_name, from_version)`.
///
/// Each upgrader is a pure payload transformation; chains are applied
/// in version order until the row reaches the target version.
#[derive(Default)]
pub struct UpgraderSet {
    map: HashMap<(String, i64), Box<dyn Fn(Value) -> Result<Value> + Send + Sync>>,
}

impl UpgraderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the upgrader consuming rows at `from_version`.
    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        from_version: i64,
        f: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) -> &mut Self {
        self.map.insert((type_name.into(), from_version), Box::new(f));
        self
    }

    fn get(
        &self,
        type_name: &str,
        from_version: i64,
    ) -> Option<&(dyn Fn(Value) -> Result<Value> + Send + Sync)> {
        self.map
            .get(&(type_name.to_string(), from_version))
            .map(|b| b.as_ref())
    }

    fn has(&self, type_name: &str, from_version: i64) -> bool {
        self.map.contains_key(&(type_name.to_string(), from_version))
    }
}

/// Input to [`Session::migrate`].
pub struct MigrationRequest<'a> {
    /// Preview only; nothing is written.
    pub dry_run: bool,
    /// Plan token from a previous preview (required to apply unless
    /// `force`). Drift detection, not authentication.
    pub token: Option<String>,
    pub upgraders: Option<&'a UpgraderSet>,
    /// Skips the token comparison.
    pub force: bool,
    /// Metadata stamped into the migration commit.
    pub metadata: BTreeMap<String, String>,
}

impl<'a> MigrationRequest<'a> {
    /// A preview request.
    pub fn preview() -> Self {
        Self {
            dry_run: true,
            token: None,
            upgraders: None,
            force: false,
            metadata: BTreeMap::new(),
        }
    }

    /// An apply request with a preview token.
    pub fn apply(token: impl Into<String>) -> Self {
        Self {
            dry_run: false,
            token: Some(token.into()),
            upgraders: None,
            force: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_upgraders(mut self, upgraders: &'a UpgraderSet) -> Self {
        self.upgraders = Some(upgraders);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Result of a migration preview.
#[derive(Clone, Debug)]
pub struct MigrationPreview {
    pub has_changes: bool,
    pub drift: SchemaDrift,
    /// Current-state rows that would be rewritten.
    pub estimated_rows: u64,
    pub types_requiring_upgraders: Vec<String>,
    pub types_schema_only: Vec<String>,
    /// `(type_name, from_version)` steps with no registered upgrader.
    pub missing_upgraders: Vec<(String, i64)>,
    /// Plan token, present when there are changes.
    pub token: Option<String>,
}

/// Result of [`Session::migrate`].
#[derive(Clone, Debug)]
pub struct MigrationReport {
    pub preview: MigrationPreview,
    pub applied: bool,
    /// Commit of the migration, when rows were rewritten.
    pub commit_id: Option<u64>,
}

/// Per-type plan detail shared between preview and apply.
struct TypePlan {
    descriptor: TypeDescriptor,
    drift: TypeDrift,
    stored_version: Option<i64>,
    target_version: i64,
    row_count: u64,
}

fn compute_plans(session: &Session) -> Result<Vec<TypePlan>> {
    let repo = session.repo();
    let mut plans = Vec::new();
    for descriptor in session.descriptors().values() {
        let stored = repo.stored_schema(descriptor.kind, &descriptor.name)?;
        let (drift, stored_version, row_count) = match &stored {
            None => {
                // A never-stored type: everything is an addition.
                let drift = TypeDrift {
                    kind: Some(descriptor.kind),
                    type_name: descriptor.name.clone(),
                    stored_version: None,
                    added: descriptor.fields.iter().map(|f| f.name.clone()).collect(),
                    ..TypeDrift::default()
                };
                (drift, None, 0)
            }
            Some(stored) => {
                let drift = diff_against_stored_fields(
                    descriptor,
                    &stored.stored_fields(),
                    Some(stored.version),
                );
                let rows = if drift.is_empty() {
                    0
                } else {
                    repo.count_current_rows(descriptor.kind, &descriptor.name, stored.version)?
                };
                (drift, Some(stored.version), rows)
            }
        };
        if drift.is_empty() {
            continue;
        }
        let stored_v = stored_version.unwrap_or(0);
        plans.push(TypePlan {
            descriptor: descriptor.clone(),
            drift,
            stored_version,
            target_version: stored_v + 1,
            row_count,
        });
    }
    Ok(plans)
}

fn plan_token(session: &Session, plans: &[TypePlan]) -> Result<Option<String>> {
    if plans.is_empty() {
        return Ok(None);
    }
    let drift = SchemaDrift {
        types: plans.iter().map(|p| p.drift.clone()).collect(),
    };
    let plan_hash = sha256_hex(to_canonical_json(&serde_json::to_value(&drift)?).as_bytes());
    let head = session.repo().head()?.commit_id;
    let head_part = if head == 0 {
        "none".to_string()
    } else {
        head.to_string()
    };
    Ok(Some(BASE64.encode(format!("{plan_hash}:{head_part}"))))
}

fn build_preview(
    session: &Session,
    plans: &[TypePlan],
    upgraders: Option<&UpgraderSet>,
) -> Result<MigrationPreview> {
    let mut requiring = Vec::new();
    let mut schema_only = Vec::new();
    let mut missing = Vec::new();
    for plan in plans {
        if plan.row_count == 0 {
            schema_only.push(plan.descriptor.name.clone());
            continue;
        }
        requiring.push(plan.descriptor.name.clone());
        let from = plan.stored_version.unwrap_or(0);
        for step in from..plan.target_version {
            let have = upgraders.map(|u| u.has(&plan.descriptor.name, step)).unwrap_or(false);
            if !have {
                missing.push((plan.descriptor.name.clone(), step));
            }
        }
    }
    Ok(MigrationPreview {
        has_changes: !plans.is_empty(),
        drift: SchemaDrift {
            types: plans.iter().map(|p| p.drift.clone()).collect(),
        },
        estimated_rows: plans.iter().map(|p| p.row_count).sum(),
        types_requiring_upgraders: requiring,
        types_schema_only: schema_only,
        missing_upgraders: missing,
        token: plan_token(session, plans)?,
    })
}

/// Validates an upgraded payload against the target descriptor: must be
/// an object, no unknown keys, identity fields untouched, omitted fields
/// filled from declared defaults.
fn validate_upgraded(descriptor: &TypeDescriptor, mut payload: Value) -> Result<Value> {
    let Some(map) = payload.as_object_mut() else {
        return Err(EngineError::validation(format!(
            "upgrader for {} must return an object",
            descriptor.name
        )));
    };
    let identity = descriptor.identity_fields();
    for key in map.keys() {
        if identity.contains(&key.as_str()) {
            return Err(EngineError::validation(format!(
                "upgrader for {} rewrote identity field `{key}`",
                descriptor.name
            )));
        }
        if descriptor.field(key).is_none() {
            return Err(EngineError::validation(format!(
                "upgrader for {} produced unknown field `{key}`",
                descriptor.name
            )));
        }
    }
    for field in descriptor.payload_fields() {
        if !map.contains_key(&field.name) {
            map.insert(
                field.name.clone(),
                field.default.clone().unwrap_or(Value::Null),
            );
        }
    }
    Ok(payload)
}

pub(crate) fn run_migration(
    session: &Session,
    request: MigrationRequest<'_>,
) -> Result<MigrationReport> {
    if request.dry_run {
        let plans = compute_plans(session)?;
        let preview = build_preview(session, &plans, request.upgraders)?;
        return Ok(MigrationReport {
            preview,
            applied: false,
            commit_id: None,
        });
    }

    let repo = session.repo();
    let lease = repo.begin_write(session.session_id())?;

    // Recompute under the lease; the token pins the plan the operator
    // approved.
    let plans = compute_plans(session)?;
    let preview = build_preview(session, &plans, request.upgraders)?;
    if !preview.has_changes {
        return Ok(MigrationReport {
            preview,
            applied: false,
            commit_id: None,
        });
    }
    if !request.force {
        match (&request.token, &preview.token) {
            (Some(supplied), Some(current)) if supplied == current => {}
            (None, _) => {
                return Err(EngineError::MigrationToken {
                    message: "apply requires the preview token (or force)".to_string(),
                });
            }
            _ => {
                return Err(EngineError::MigrationToken {
                    message: "the store changed since the preview; re-run preview".to_string(),
                });
            }
        }
    }
    if let Some((type_name, from_version)) = preview.missing_upgraders.first() {
        return Err(EngineError::MissingUpgrader {
            type_name: type_name.clone(),
            from_version: *from_version,
        });
    }

    let mut activations = Vec::new();
    let mut changes = Vec::new();
    let mut expected_versions = BTreeMap::new();

    for plan in &plans {
        activations.push(SchemaActivation {
            kind: plan.descriptor.kind,
            type_name: plan.descriptor.name.clone(),
            schema_version_id: plan.target_version,
            schema_json: plan.descriptor.to_registry_json()?,
            schema_hash: schema_hash(&plan.descriptor)?,
            reason: if plan.stored_version.is_none() {
                "initial registration".to_string()
            } else {
                "migration".to_string()
            },
        });
        if let Some(stored_version) = plan.stored_version {
            expected_versions.insert(plan.descriptor.name.clone(), stored_version);
        }
        if plan.row_count == 0 {
            continue;
        }

        // Rewrite every current-state row through the upgrader chain.
        let upgraders = request.upgraders.ok_or_else(|| EngineError::MissingUpgrader {
            type_name: plan.descriptor.name.clone(),
            from_version: plan.stored_version.unwrap_or(0),
        })?;
        let mut row_request = QueryRequest::latest(plan.descriptor.clone());
        row_request.schema_version = plan.stored_version.unwrap_or(0);
        let rows = repo.query_rows(&row_request)?;
        debug!(
            type_name = %plan.descriptor.name,
            rows = rows.len(),
            target = plan.target_version,
            "upgrading current-state rows"
        );
        for row in rows {
            let mut payload = row.fields.clone();
            for step in row.schema_version_id..plan.target_version {
                let upgrader = upgraders
                    .get(&plan.descriptor.name, step)
                    .ok_or_else(|| EngineError::MissingUpgrader {
                        type_name: plan.descriptor.name.clone(),
                        from_version: step,
                    })?;
                payload = upgrader(payload).map_err(|e| EngineError::Migration {
                    type_name: plan.descriptor.name.clone(),
                    identity: row.identity.to_string(),
                    stage: format!("upgrade v{step}->v{}", step + 1),
                    message: format!("{e}; input: {}", to_canonical_json(&row.fields)),
                })?;
            }
            let payload = validate_upgraded(&plan.descriptor, payload).map_err(|e| {
                EngineError::Migration {
                    type_name: plan.descriptor.name.clone(),
                    identity: row.identity.to_string(),
                    stage: "validate".to_string(),
                    message: e.to_string(),
                }
            })?;
            changes.push(ChangeWrite {
                record: ChangeRecord {
                    kind: plan.descriptor.kind,
                    type_name: plan.descriptor.name.clone(),
                    identity: row.identity,
                    operation: ChangeOp::UpdateVersion,
                },
                payload,
                schema_version_id: plan.target_version,
            });
        }
    }

    let commit_id = if changes.is_empty() {
        // Schema-only plans (no current rows anywhere): activation
        // without a data commit.
        repo.register_schemas(&lease, &activations)?;
        None
    } else {
        let draft = CommitDraft {
            changes,
            metadata: request.metadata,
            expected_versions,
            schema_activations: activations,
        };
        Some(repo.append_commit(&lease, draft)?)
    };
    drop(lease);

    info!(
        types = plans.len(),
        rows = preview.estimated_rows,
        ?commit_id,
        "migration applied"
    );
    Ok(MigrationReport {
        preview,
        applied: true,
        commit_id,
    })
}
