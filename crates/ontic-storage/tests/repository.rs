//! Backend-neutral repository tests, run against both the SQLite and the
//! object-store implementations.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use ontic_core::commit::{ChangeOp, ChangeRecord, ChangeWrite, CommitDraft, SchemaActivation};
use ontic_core::config::{EngineConfig, EngineVersion};
use ontic_core::descriptor::{RecordKind, TypeDescriptor};
use ontic_core::error::EngineError;
use ontic_core::filter::{CompareOp, Comparison, ExistsComparison, FieldPath, Filter, Operand};
use ontic_core::identity::Identity;
use ontic_core::query::{AggFunc, AggregateCall, QueryRequest, TemporalMode};
use ontic_core::spec::TypeSpec;
use ontic_storage::{Repository, open_repository};

fn customer_descriptor() -> TypeDescriptor {
    TypeDescriptor::entity("Customer")
        .primary_key("id")
        .field("name", TypeSpec::str())
        .field("age", TypeSpec::optional(TypeSpec::int()))
        .field("tags", TypeSpec::list(TypeSpec::str()))
        .field("meta", TypeSpec::dict(TypeSpec::str()))
        .build()
        .unwrap()
}

fn employment_descriptor() -> TypeDescriptor {
    TypeDescriptor::relation("Employment")
        .left("Customer", "person_id")
        .right("Customer", "company_id")
        .instance_key("stint_id")
        .field("role", TypeSpec::str())
        .build()
        .unwrap()
}

fn activation(descriptor: &TypeDescriptor, version: i64) -> SchemaActivation {
    SchemaActivation {
        kind: descriptor.kind,
        type_name: descriptor.name.clone(),
        schema_version_id: version,
        schema_json: descriptor.to_registry_json().unwrap(),
        schema_hash: descriptor.fields[0].spec.fingerprint(),
        reason: "initial registration".into(),
    }
}

fn register(repo: &dyn Repository, descriptors: &[TypeDescriptor]) {
    let lease = repo.begin_write("registrar").unwrap();
    let activations: Vec<SchemaActivation> =
        descriptors.iter().map(|d| activation(d, 1)).collect();
    repo.register_schemas(&lease, &activations).unwrap();
}

fn entity_change(key: &str, payload: Value, version: i64, op: ChangeOp) -> ChangeWrite {
    ChangeWrite {
        record: ChangeRecord {
            kind: RecordKind::Entity,
            type_name: "Customer".into(),
            identity: Identity::Entity { key: key.into() },
            operation: op,
        },
        payload,
        schema_version_id: version,
    }
}

fn commit_customers(repo: &dyn Repository, rows: &[(&str, Value)], op: ChangeOp) -> u64 {
    let lease = repo.begin_write("writer").unwrap();
    let draft = CommitDraft {
        changes: rows
            .iter()
            .map(|(key, payload)| entity_change(key, payload.clone(), 1, op))
            .collect(),
        metadata: BTreeMap::new(),
        expected_versions: BTreeMap::from([("Customer".to_string(), 1)]),
        schema_activations: Vec::new(),
    };
    repo.append_commit(&lease, draft).unwrap()
}

fn latest_request() -> QueryRequest {
    let mut request = QueryRequest::latest(customer_descriptor());
    request.schema_version = 1;
    request
}

fn compare(path: &str, op: CompareOp, operand: Operand) -> Filter {
    Filter::Compare(Comparison {
        path: FieldPath::parse(path).unwrap(),
        op,
        operand,
    })
}

fn backend_uris(tag: &str) -> Vec<String> {
    vec![
        "sqlite://:memory:".to_string(),
        format!("mem://repo-tests-{tag}/store"),
    ]
}

// ---------------------------------------------------------------------------
// Commit path
// ---------------------------------------------------------------------------

#[test]
fn first_commit_is_one_and_head_tracks() {
    for uri in backend_uris("head") {
        let repo = open_repository(&uri, &EngineConfig::default()).unwrap();
        assert_eq!(repo.head().unwrap().commit_id, 0, "{uri}");
        register(repo.as_ref(), &[customer_descriptor()]);

        let cid = commit_customers(
            repo.as_ref(),
            &[("c1", json!({ "name": "Alice", "age": 30, "tags": [], "meta": {} }))],
            ChangeOp::Insert,
        );
        assert_eq!(cid, 1, "{uri}");
        assert_eq!(repo.head().unwrap().commit_id, 1, "{uri}");

        let rows = repo.query_rows(&latest_request()).unwrap();
        assert_eq!(rows.len(), 1, "{uri}");
        assert_eq!(rows[0].commit_id, 1);
        assert_eq!(rows[0].fields["name"], json!("Alice"));
    }
}

#[test]
fn schema_drift_under_lease_aborts_commit() {
    for uri in backend_uris("drift") {
        let repo = open_repository(&uri, &EngineConfig::default()).unwrap();
        register(repo.as_ref(), &[customer_descriptor()]);

        let lease = repo.begin_write("writer").unwrap();
        let draft = CommitDraft {
            changes: vec![entity_change(
                "c1",
                json!({ "name": "Alice", "age": null, "tags": [], "meta": {} }),
                1,
                ChangeOp::Insert,
            )],
            metadata: BTreeMap::new(),
            // Stale cache: expects version 2 while the store has 1.
            expected_versions: BTreeMap::from([("Customer".to_string(), 2)]),
            schema_activations: Vec::new(),
        };
        let err = repo.append_commit(&lease, draft).unwrap_err();
        assert!(err.is_schema_outdated(), "{uri}");
        drop(lease);

        // Nothing observable was committed.
        assert_eq!(repo.head().unwrap().commit_id, 0, "{uri}");
        assert!(repo.query_rows(&latest_request()).unwrap().is_empty());
    }
}

#[test]
fn batch_size_cap_rejects_oversized_drafts() {
    for uri in backend_uris("batch") {
        let config = EngineConfig {
            max_batch_size: 2,
            ..EngineConfig::default()
        };
        let repo = open_repository(&uri, &config).unwrap();
        register(repo.as_ref(), &[customer_descriptor()]);

        let lease = repo.begin_write("writer").unwrap();
        let draft = CommitDraft {
            changes: (0..3)
                .map(|i| {
                    entity_change(
                        &format!("c{i}"),
                        json!({ "name": "x", "age": null, "tags": [], "meta": {} }),
                        1,
                        ChangeOp::Insert,
                    )
                })
                .collect(),
            metadata: BTreeMap::new(),
            expected_versions: BTreeMap::from([("Customer".to_string(), 1)]),
            schema_activations: Vec::new(),
        };
        let err = repo.append_commit(&lease, draft).unwrap_err();
        assert!(matches!(err, EngineError::BatchSizeExceeded { size: 3, limit: 2 }), "{uri}");
        drop(lease);
        assert_eq!(repo.head().unwrap().commit_id, 0, "{uri}");
    }
}

#[test]
fn temporal_modes_window_and_dedup() {
    for uri in backend_uris("temporal") {
        let repo = open_repository(&uri, &EngineConfig::default()).unwrap();
        register(repo.as_ref(), &[customer_descriptor()]);

        commit_customers(
            repo.as_ref(),
            &[("c1", json!({ "name": "v1", "age": 1, "tags": [], "meta": {} }))],
            ChangeOp::Insert,
        );
        commit_customers(
            repo.as_ref(),
            &[("c1", json!({ "name": "v2", "age": 2, "tags": [], "meta": {} }))],
            ChangeOp::UpdateVersion,
        );
        commit_customers(
            repo.as_ref(),
            &[("c2", json!({ "name": "other", "age": 9, "tags": [], "meta": {} }))],
            ChangeOp::Insert,
        );

        // Latest: one row per identity, newest version.
        let mut latest = latest_request();
        latest.temporal = TemporalMode::Latest;
        let rows = repo.query_rows(&latest).unwrap();
        assert_eq!(rows.len(), 2, "{uri}");
        let c1 = rows
            .iter()
            .find(|r| r.identity == Identity::Entity { key: "c1".into() })
            .unwrap();
        assert_eq!(c1.fields["name"], json!("v2"));

        // As-of commit 1.
        let mut as_of = latest_request();
        as_of.temporal = TemporalMode::AsOf(1);
        let rows = repo.query_rows(&as_of).unwrap();
        assert_eq!(rows.len(), 1, "{uri}");
        assert_eq!(rows[0].fields["name"], json!("v1"));

        // Full history, commit order.
        let mut history = latest_request();
        history.temporal = TemporalMode::WithHistory;
        let rows = repo.query_rows(&history).unwrap();
        let commits: Vec<u64> = rows.iter().map(|r| r.commit_id).collect();
        assert_eq!(commits, vec![1, 2, 3], "{uri}");

        // History strictly after commit 1.
        let mut since = latest_request();
        since.temporal = TemporalMode::HistorySince(1);
        let rows = repo.query_rows(&since).unwrap();
        let commits: Vec<u64> = rows.iter().map(|r| r.commit_id).collect();
        assert_eq!(commits, vec![2, 3], "{uri}");
    }
}

#[test]
fn keyed_relations_are_separate_identities() {
    for uri in backend_uris("relations") {
        let repo = open_repository(&uri, &EngineConfig::default()).unwrap();
        register(
            repo.as_ref(),
            &[customer_descriptor(), employment_descriptor()],
        );

        let lease = repo.begin_write("writer").unwrap();
        let change = |stint: &str, role: &str| ChangeWrite {
            record: ChangeRecord {
                kind: RecordKind::Relation,
                type_name: "Employment".into(),
                identity: Identity::Relation {
                    left_key: "p1".into(),
                    right_key: "c1".into(),
                    instance_key: stint.into(),
                },
                operation: ChangeOp::Insert,
            },
            payload: json!({ "role": role }),
            schema_version_id: 1,
        };
        let draft = CommitDraft {
            changes: vec![change("a", "Eng"), change("b", "Mgr")],
            metadata: BTreeMap::new(),
            expected_versions: BTreeMap::from([("Employment".to_string(), 1)]),
            schema_activations: Vec::new(),
        };
        repo.append_commit(&lease, draft).unwrap();
        drop(lease);

        let mut rel_request = QueryRequest::latest(employment_descriptor());
        rel_request.schema_version = 1;
        let rows = repo.query_rows(&rel_request).unwrap();
        assert_eq!(rows.len(), 2, "{uri}");
    }
}

#[test]
fn commit_inspection_reports_operations() {
    for uri in backend_uris("inspect") {
        let repo = open_repository(&uri, &EngineConfig::default()).unwrap();
        register(repo.as_ref(), &[customer_descriptor()]);

        commit_customers(
            repo.as_ref(),
            &[("c1", json!({ "name": "a", "age": null, "tags": [], "meta": {} }))],
            ChangeOp::Insert,
        );
        commit_customers(
            repo.as_ref(),
            &[("c1", json!({ "name": "b", "age": null, "tags": [], "meta": {} }))],
            ChangeOp::UpdateVersion,
        );

        let commits = repo.list_commits(10, None).unwrap();
        assert_eq!(commits.len(), 2, "{uri}");
        assert_eq!(commits[0].commit_id, 2);
        assert_eq!(commits[1].commit_id, 1);

        assert!(repo.get_commit(1).unwrap().is_some());
        assert!(repo.get_commit(99).unwrap().is_none());

        let changes = repo.list_commit_changes(1).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].operation, ChangeOp::Insert);
        let changes = repo.list_commit_changes(2).unwrap();
        assert_eq!(changes[0].operation, ChangeOp::UpdateVersion);
    }
}

#[test]
fn lock_contention_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contended.db");
    let uri = format!("sqlite://{}", path.display());
    let config = EngineConfig {
        lock_timeout_ms: 150,
        ..EngineConfig::default()
    };
    let repo_a = open_repository(&uri, &config).unwrap();
    let repo_b = open_repository(&uri, &config).unwrap();

    let held = repo_a.begin_write("owner-a").unwrap();
    let err = repo_b.begin_write("owner-b").unwrap_err();
    assert!(matches!(err, EngineError::LockContention { .. }));
    drop(held);

    // Released: the second owner can acquire now.
    let lease = repo_b.begin_write("owner-b").unwrap();
    drop(lease);
}

#[test]
fn serialized_writers_produce_dense_commit_ids() {
    let uri = "mem://repo-tests-concurrent/store";
    let config = EngineConfig::default();
    {
        let repo = open_repository(uri, &config).unwrap();
        register(repo.as_ref(), &[customer_descriptor()]);
    }

    let mut threads = Vec::new();
    for t in 0..2 {
        let config = config.clone();
        threads.push(std::thread::spawn(move || {
            let repo = open_repository("mem://repo-tests-concurrent/store", &config).unwrap();
            for i in 0..3 {
                commit_customers(
                    repo.as_ref(),
                    &[(
                        &format!("w{t}-{i}"),
                        json!({ "name": "x", "age": null, "tags": [], "meta": {} }),
                    )],
                    ChangeOp::Insert,
                );
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    let repo = open_repository(uri, &config).unwrap();
    assert_eq!(repo.head().unwrap().commit_id, 6);
    let commits = repo.list_commits(10, None).unwrap();
    let ids: Vec<u64> = commits.iter().map(|c| c.commit_id).collect();
    assert_eq!(ids, vec![6, 5, 4, 3, 2, 1]);
    let rows = repo.query_rows(&latest_request()).unwrap();
    assert_eq!(rows.len(), 6);
}

// ---------------------------------------------------------------------------
// Predicates and aggregation
// ---------------------------------------------------------------------------

fn seed_predicate_rows(repo: &dyn Repository) {
    commit_customers(
        repo,
        &[
            (
                "c1",
                json!({ "name": "Alice", "age": 30, "tags": ["rust", "db"], "meta": { "origin": "web" } }),
            ),
            (
                "c2",
                json!({ "name": "Bob", "age": 17, "tags": [], "meta": { "origin": "import" } }),
            ),
            (
                "c3",
                json!({ "name": "Carol", "age": null, "tags": null, "meta": {} }),
            ),
        ],
        ChangeOp::Insert,
    );
}

#[test]
fn predicate_shapes_match_across_backends() {
    for uri in backend_uris("predicates") {
        let repo = open_repository(&uri, &EngineConfig::default()).unwrap();
        register(repo.as_ref(), &[customer_descriptor()]);
        seed_predicate_rows(repo.as_ref());

        let keys = |filter: Filter| -> Vec<String> {
            let mut request = latest_request();
            request.filter = Some(filter);
            let mut keys: Vec<String> = repo
                .query_rows(&request)
                .unwrap()
                .into_iter()
                .map(|r| match r.identity {
                    Identity::Entity { key } => key,
                    _ => unreachable!(),
                })
                .collect();
            keys.sort();
            keys
        };

        // Identity column predicate.
        assert_eq!(
            keys(compare("id", CompareOp::Eq, Operand::Scalar("c1".into()))),
            vec!["c1"],
            "{uri}"
        );
        // Nested JSON path.
        assert_eq!(
            keys(compare(
                "meta.origin",
                CompareOp::Eq,
                Operand::Scalar("web".into())
            )),
            vec!["c1"],
            "{uri}"
        );
        // Ordered comparison skips nulls.
        assert_eq!(
            keys(compare("age", CompareOp::Ge, Operand::Scalar(18i64.into()))),
            vec!["c1"],
            "{uri}"
        );
        // Existential over lists; null and empty lists are false.
        assert_eq!(
            keys(Filter::Exists(ExistsComparison {
                list_path: FieldPath::parse("tags").unwrap(),
                item_path: None,
                op: CompareOp::Eq,
                operand: Operand::Scalar("rust".into()),
            })),
            vec!["c1"],
            "{uri}"
        );
        // Empty in_() never matches.
        assert_eq!(
            keys(compare("name", CompareOp::In, Operand::List(vec![]))),
            Vec::<String>::new(),
            "{uri}"
        );
        // is_null on a missing/null field.
        assert_eq!(
            keys(compare("age", CompareOp::IsNull, Operand::None)),
            vec!["c3"],
            "{uri}"
        );
        // String predicates.
        assert_eq!(
            keys(compare(
                "name",
                CompareOp::StartsWith,
                Operand::Scalar("Al".into())
            )),
            vec!["c1"],
            "{uri}"
        );
        // Boolean composition with three-valued semantics.
        assert_eq!(
            keys(
                compare("age", CompareOp::Lt, Operand::Scalar(18i64.into()))
                    | compare("meta.origin", CompareOp::Eq, Operand::Scalar("web".into()))
            ),
            vec!["c1", "c2"],
            "{uri}"
        );
    }
}

#[test]
fn aggregates_follow_sql_semantics() {
    for uri in backend_uris("aggregates") {
        let repo = open_repository(&uri, &EngineConfig::default()).unwrap();
        register(repo.as_ref(), &[customer_descriptor()]);
        seed_predicate_rows(repo.as_ref());
        let base = latest_request();

        let agg = |call: AggregateCall| repo.aggregate(&base, &call).unwrap();

        assert_eq!(agg(AggregateCall::count()), json!(3), "{uri}");
        assert_eq!(
            agg(AggregateCall::over(
                AggFunc::Sum,
                FieldPath::parse("age").unwrap()
            )),
            json!(47),
            "{uri}"
        );
        assert_eq!(
            agg(AggregateCall::over(
                AggFunc::Min,
                FieldPath::parse("age").unwrap()
            )),
            json!(17),
            "{uri}"
        );
        // avg_len: null list excluded, [] contributes 0.
        assert_eq!(
            agg(AggregateCall::over(
                AggFunc::AvgLen,
                FieldPath::parse("tags").unwrap()
            )),
            json!(1.0),
            "{uri}"
        );
    }
}

// ---------------------------------------------------------------------------
// Evaluator parity
// ---------------------------------------------------------------------------

/// The SQLite compiler and the in-process evaluator must agree on every
/// fixture; the object-store backend runs through the evaluator, so this
/// pins all three.
#[test]
fn sql_and_in_process_evaluation_agree() {
    let repo = open_repository("sqlite://:memory:", &EngineConfig::default()).unwrap();
    register(repo.as_ref(), &[customer_descriptor()]);
    seed_predicate_rows(repo.as_ref());

    let fixtures: Vec<Filter> = vec![
        compare("name", CompareOp::Eq, Operand::Scalar("Alice".into())),
        compare("name", CompareOp::Ne, Operand::Scalar("Alice".into())),
        compare("age", CompareOp::Gt, Operand::Scalar(20i64.into())),
        compare("age", CompareOp::Le, Operand::Scalar(30i64.into())),
        compare("age", CompareOp::IsNull, Operand::None),
        compare("age", CompareOp::IsNotNull, Operand::None),
        compare(
            "name",
            CompareOp::In,
            Operand::List(vec!["Alice".into(), "Bob".into()]),
        ),
        compare("name", CompareOp::In, Operand::List(vec![])),
        compare("name", CompareOp::Contains, Operand::Scalar("o".into())),
        compare("name", CompareOp::EndsWith, Operand::Scalar("ce".into())),
        compare("meta.origin", CompareOp::Eq, Operand::Scalar("web".into())),
        compare("meta.origin", CompareOp::IsNull, Operand::None),
        Filter::Exists(ExistsComparison {
            list_path: FieldPath::parse("tags").unwrap(),
            item_path: None,
            op: CompareOp::Eq,
            operand: Operand::Scalar("db".into()),
        }),
        !compare("name", CompareOp::Eq, Operand::Scalar("Alice".into())),
        compare("age", CompareOp::Gt, Operand::Scalar(20i64.into()))
            & compare("name", CompareOp::StartsWith, Operand::Scalar("A".into())),
        compare("age", CompareOp::IsNull, Operand::None)
            | compare("meta.origin", CompareOp::Eq, Operand::Scalar("import".into())),
        !(compare("age", CompareOp::Gt, Operand::Scalar(20i64.into()))
            | compare("name", CompareOp::Eq, Operand::Scalar("Bob".into()))),
    ];

    let descriptor = customer_descriptor();
    let all = repo.query_rows(&latest_request()).unwrap();
    assert_eq!(all.len(), 3);

    for (i, filter) in fixtures.iter().enumerate() {
        let mut sql_request = latest_request();
        sql_request.filter = Some(filter.clone());
        let mut sql_keys: Vec<String> = repo
            .query_rows(&sql_request)
            .unwrap()
            .into_iter()
            .map(|r| r.identity.storage_key())
            .collect();
        sql_keys.sort();

        let mut eval_keys: Vec<String> = all
            .iter()
            .filter(|row| ontic_core::eval::matches(filter, &row.view(&descriptor)))
            .map(|r| r.identity.storage_key())
            .collect();
        eval_keys.sort();

        assert_eq!(sql_keys, eval_keys, "fixture #{i} diverged: {filter:?}");
    }
}

// ---------------------------------------------------------------------------
// Engine versions
// ---------------------------------------------------------------------------

#[test]
fn v1_engine_skips_typed_partitions() {
    let config = EngineConfig {
        engine_version: EngineVersion::V1,
        ..EngineConfig::default()
    };
    let repo = open_repository("sqlite://:memory:", &config).unwrap();
    assert_eq!(repo.engine_version(), EngineVersion::V1);
    register(repo.as_ref(), &[customer_descriptor()]);
    seed_predicate_rows(repo.as_ref());

    let rows = repo.query_rows(&latest_request()).unwrap();
    assert_eq!(rows.len(), 3);
}

#[test]
fn engine_version_persists_across_opens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("versioned.db");
    let uri = format!("sqlite://{}", path.display());

    let v1 = EngineConfig {
        engine_version: EngineVersion::V1,
        ..EngineConfig::default()
    };
    {
        let repo = open_repository(&uri, &v1).unwrap();
        assert_eq!(repo.engine_version(), EngineVersion::V1);
    }
    // A later open asking for v2 keeps the store's recorded generation.
    let repo = open_repository(&uri, &EngineConfig::default()).unwrap();
    assert_eq!(repo.engine_version(), EngineVersion::V1);
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

#[test]
fn compaction_preserves_every_query_mode() {
    let uri = "mem://repo-tests-compaction/store";
    let repo = open_repository(uri, &EngineConfig::default()).unwrap();
    register(repo.as_ref(), &[customer_descriptor()]);

    commit_customers(
        repo.as_ref(),
        &[("c1", json!({ "name": "v1", "age": 1, "tags": [], "meta": {} }))],
        ChangeOp::Insert,
    );
    commit_customers(
        repo.as_ref(),
        &[("c1", json!({ "name": "v2", "age": 2, "tags": [], "meta": {} }))],
        ChangeOp::UpdateVersion,
    );
    commit_customers(
        repo.as_ref(),
        &[("c2", json!({ "name": "w", "age": 3, "tags": ["t"], "meta": {} }))],
        ChangeOp::Insert,
    );

    let snapshot = |temporal: TemporalMode, filter: Option<Filter>| {
        let mut req = latest_request();
        req.temporal = temporal;
        req.filter = filter;
        let mut rows = repo.query_rows(&req).unwrap();
        rows.sort_by_key(|r| (r.commit_id, r.identity.storage_key()));
        rows.into_iter()
            .map(|r| (r.commit_id, r.identity.storage_key(), r.fields))
            .collect::<Vec<_>>()
    };
    let age_filter = || Some(compare("age", CompareOp::Ge, Operand::Scalar(2i64.into())));

    let before = [
        snapshot(TemporalMode::Latest, None),
        snapshot(TemporalMode::Latest, age_filter()),
        snapshot(TemporalMode::AsOf(1), None),
        snapshot(TemporalMode::WithHistory, None),
        snapshot(TemporalMode::HistorySince(1), None),
    ];

    let lease = repo.begin_write("compactor").unwrap();
    let report = repo.compact(&lease).unwrap();
    drop(lease);
    assert_eq!(report.snapshots_written, 1);
    assert!(report.files_merged >= 3);
    assert_eq!(report.rows, 3);

    let after = [
        snapshot(TemporalMode::Latest, None),
        snapshot(TemporalMode::Latest, age_filter()),
        snapshot(TemporalMode::AsOf(1), None),
        snapshot(TemporalMode::WithHistory, None),
        snapshot(TemporalMode::HistorySince(1), None),
    ];
    assert_eq!(before, after);

    // Compaction on the transactional backend is an invalid context.
    let sqlite = open_repository("sqlite://:memory:", &EngineConfig::default()).unwrap();
    let lease = sqlite.begin_write("compactor").unwrap();
    assert!(matches!(
        sqlite.compact(&lease).unwrap_err(),
        EngineError::InvalidExecutionContext { .. }
    ));
}
