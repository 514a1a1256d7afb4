//! End-to-end session scenarios over both backends.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use ontic_core::descriptor::TypeDescriptor;
use ontic_core::error::EngineError;
use ontic_core::filter::{CompareOp, Scalar};
use ontic_core::intent::{EntityType, RelationType};
use ontic_core::spec::TypeSpec;
use ontic_query::{count, field};
use ontic_session::{MigrationRequest, Session, SessionOptions, UpgraderSet};
use ontic_storage::Repository;

// ---------------------------------------------------------------------------
// Test domain
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize)]
struct Customer {
    id: String,
    name: String,
}

impl EntityType for Customer {
    const NAME: &'static str = "Customer";

    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::entity("Customer")
            .primary_key("id")
            .field("name", TypeSpec::str())
            .build()
            .expect("static descriptor")
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Person {
    id: String,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    orders: Vec<Order>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Order {
    total: i64,
}

impl EntityType for Person {
    const NAME: &'static str = "Person";

    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::entity("Person")
            .primary_key("id")
            .field("city", TypeSpec::optional(TypeSpec::str()))
            .field(
                "orders",
                TypeSpec::list(TypeSpec::typed_dict("Order", [("total", TypeSpec::int())])),
            )
            .build()
            .expect("static descriptor")
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct Employment {
    person_id: String,
    company_id: String,
    stint_id: String,
    role: String,
}

impl RelationType for Employment {
    const NAME: &'static str = "Employment";
    type Left = Person;
    type Right = Customer;

    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::relation("Employment")
            .left("Person", "person_id")
            .right("Customer", "company_id")
            .instance_key("stint_id")
            .field("role", TypeSpec::str())
            .build()
            .expect("static descriptor")
    }

    fn left_key(&self) -> String {
        self.person_id.clone()
    }
    fn right_key(&self) -> String {
        self.company_id.clone()
    }
    fn instance_key(&self) -> Option<String> {
        Some(self.stint_id.clone())
    }
}

fn options(types: &[TypeDescriptor], relations: &[TypeDescriptor]) -> SessionOptions {
    SessionOptions {
        entity_types: types.to_vec(),
        relation_types: relations.to_vec(),
        ..SessionOptions::default()
    }
}

fn backend_uris(tag: &str) -> Vec<String> {
    vec![
        "sqlite://:memory:".to_string(),
        format!("mem://session-tests-{tag}/store"),
    ]
}

// ---------------------------------------------------------------------------
// Delta reconciliation
// ---------------------------------------------------------------------------

#[test]
fn unchanged_payload_produces_no_second_commit() {
    for uri in backend_uris("noop") {
        let session = Session::new(&uri, options(&[Customer::descriptor()], &[])).unwrap();

        session
            .ensure_entity(&Customer {
                id: "c1".into(),
                name: "Alice".into(),
            })
            .unwrap();
        let first = session.commit(None).unwrap();
        assert_eq!(first, Some(1), "{uri}");

        session
            .ensure_entity(&Customer {
                id: "c1".into(),
                name: "Alice".into(),
            })
            .unwrap();
        let second = session.commit(None).unwrap();
        assert_eq!(second, None, "{uri}");
        assert_eq!(session.repo().head().unwrap().commit_id, 1, "{uri}");

        // A changed payload appends a version.
        session
            .ensure_entity(&Customer {
                id: "c1".into(),
                name: "Alice Cooper".into(),
            })
            .unwrap();
        assert_eq!(session.commit(None).unwrap(), Some(2), "{uri}");
    }
}

#[test]
fn later_intent_for_same_identity_wins() {
    for uri in backend_uris("override") {
        let session = Session::new(&uri, options(&[Customer::descriptor()], &[])).unwrap();
        session
            .ensure_entity(&Customer {
                id: "c1".into(),
                name: "first".into(),
            })
            .unwrap();
        session
            .ensure_entity(&Customer {
                id: "c1".into(),
                name: "second".into(),
            })
            .unwrap();
        assert_eq!(session.commit(None).unwrap(), Some(1), "{uri}");

        let query = session.query().unwrap();
        let stored = query
            .entities::<Customer>()
            .unwrap()
            .first()
            .unwrap()
            .unwrap();
        assert_eq!(stored.name, "second", "{uri}");
        // One identity, one history row.
        let rows = session
            .query()
            .unwrap()
            .entities::<Customer>()
            .unwrap()
            .with_history()
            .rows()
            .unwrap();
        assert_eq!(rows.len(), 1, "{uri}");
    }
}

#[test]
fn empty_ensure_is_a_noop() {
    for uri in backend_uris("empty") {
        let session = Session::new(&uri, options(&[Customer::descriptor()], &[])).unwrap();
        session.ensure_intents(Vec::new()).unwrap();
        assert_eq!(session.commit(None).unwrap(), None, "{uri}");
        assert_eq!(session.repo().head().unwrap().commit_id, 0, "{uri}");
    }
}

#[test]
fn keyed_relation_multiplicity() {
    for uri in backend_uris("keyed") {
        let session = Session::new(
            &uri,
            options(
                &[Customer::descriptor(), Person::descriptor()],
                &[Employment::descriptor()],
            ),
        )
        .unwrap();

        session
            .ensure_relation(&Employment {
                person_id: "p1".into(),
                company_id: "c1".into(),
                stint_id: "a".into(),
                role: "Eng".into(),
            })
            .unwrap();
        session
            .ensure_relation(&Employment {
                person_id: "p1".into(),
                company_id: "c1".into(),
                stint_id: "b".into(),
                role: "Mgr".into(),
            })
            .unwrap();
        assert_eq!(session.commit(None).unwrap(), Some(1), "{uri}");

        let query = session.query().unwrap();
        let n = query.relations::<Employment>().unwrap().count().unwrap();
        assert_eq!(n, 2, "{uri}");
    }
}

// ---------------------------------------------------------------------------
// Query DSL
// ---------------------------------------------------------------------------

fn seed_people(session: &Session) {
    session
        .ensure_entity(&Person {
            id: "p1".into(),
            city: Some("Berlin".into()),
            orders: vec![Order { total: 50 }, Order { total: 5 }],
        })
        .unwrap();
    session
        .ensure_entity(&Person {
            id: "p2".into(),
            city: Some("Berlin".into()),
            orders: vec![],
        })
        .unwrap();
    session
        .ensure_entity(&Person {
            id: "p3".into(),
            city: None,
            orders: vec![Order { total: 9 }],
        })
        .unwrap();
    session.commit(None).unwrap();
}

#[test]
fn null_equality_is_a_build_time_error() {
    for uri in backend_uris("nulleq") {
        let session = Session::new(&uri, options(&[Person::descriptor()], &[])).unwrap();
        seed_people(&session);
        let query = session.query().unwrap();

        let err = query
            .entities::<Person>()
            .unwrap()
            .where_(field("city").eq(Scalar::Null))
            .collect()
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }), "{uri}");

        // is_null is the one accepted null predicate.
        let query = session.query().unwrap();
        let keys: Vec<String> = query
            .entities::<Person>()
            .unwrap()
            .where_(field("city").is_null())
            .collect()
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(keys, vec!["p3"], "{uri}");
    }
}

#[test]
fn existential_predicates_over_lists() {
    for uri in backend_uris("exists") {
        let session = Session::new(&uri, options(&[Person::descriptor()], &[])).unwrap();
        seed_people(&session);

        let query = session.query().unwrap();
        let keys: Vec<String> = query
            .entities::<Person>()
            .unwrap()
            .where_(field("orders").any_path("total").gt(10))
            .collect()
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(keys, vec!["p1"], "{uri}");

        // Empty and missing lists never match.
        let query = session.query().unwrap();
        let n = query
            .entities::<Person>()
            .unwrap()
            .count_where(field("orders").any_path("total").gt(0))
            .unwrap();
        assert_eq!(n, 2, "{uri}");

        // any_path on a non-list field is rejected at build time.
        let query = session.query().unwrap();
        let err = query
            .entities::<Person>()
            .unwrap()
            .where_(field("city").any_path("x").eq(1))
            .collect()
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }), "{uri}");

        // The list check applies at any path depth: `orders.total` is
        // not list-typed either.
        let query = session.query().unwrap();
        let err = query
            .entities::<Person>()
            .unwrap()
            .where_(field("orders").path("total").any_path("x").gt(1))
            .collect()
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }), "{uri}");
    }
}

#[test]
fn aggregation_and_grouping() {
    for uri in backend_uris("agg") {
        let session = Session::new(&uri, options(&[Person::descriptor()], &[])).unwrap();
        seed_people(&session);

        let query = session.query().unwrap();
        let avg_len = query
            .entities::<Person>()
            .unwrap()
            .avg_len(&field("orders"))
            .unwrap();
        assert_eq!(avg_len, json!(1.0), "{uri}");

        let query = session.query().unwrap();
        let groups = query
            .entities::<Person>()
            .unwrap()
            .group_by(&[&field("city")])
            .agg("n", count())
            .having("n", CompareOp::Gt, 1)
            .collect()
            .unwrap();
        assert_eq!(groups.len(), 1, "{uri}");
        assert_eq!(groups[0].get("city"), Some(&json!("Berlin")), "{uri}");
        assert_eq!(groups[0].get("n"), Some(&json!(2)), "{uri}");
    }
}

#[test]
fn endpoint_predicates_and_traversal() {
    for uri in backend_uris("traverse") {
        let session = Session::new(
            &uri,
            options(
                &[Customer::descriptor(), Person::descriptor()],
                &[Employment::descriptor()],
            ),
        )
        .unwrap();
        seed_people(&session);
        session
            .ensure_entity(&Customer {
                id: "acme".into(),
                name: "Acme".into(),
            })
            .unwrap();
        session
            .ensure_entity(&Customer {
                id: "globex".into(),
                name: "Globex".into(),
            })
            .unwrap();
        for (person, company, stint) in [
            ("p1", "acme", "s1"),
            ("p1", "acme", "s2"),
            ("p1", "globex", "s3"),
            ("p2", "globex", "s4"),
        ] {
            session
                .ensure_relation(&Employment {
                    person_id: person.into(),
                    company_id: company.into(),
                    stint_id: stint.into(),
                    role: "Eng".into(),
                })
                .unwrap();
        }
        session.commit(None).unwrap();

        // Endpoint predicate: employments whose left person is in Berlin.
        let query = session.query().unwrap();
        let n = query
            .relations::<Employment>()
            .unwrap()
            .where_left(field("city").eq("Berlin"))
            .count()
            .unwrap();
        assert_eq!(n, 4, "{uri}");

        let query = session.query().unwrap();
        let n = query
            .relations::<Employment>()
            .unwrap()
            .where_right(field("name").eq("Acme"))
            .count()
            .unwrap();
        assert_eq!(n, 2, "{uri}");

        // Traversal: destinations deduplicated per source, zero-hop
        // sources preserved.
        let query = session.query().unwrap();
        let paths = query
            .entities::<Person>()
            .unwrap()
            .via::<Employment>()
            .unwrap()
            .collect()
            .unwrap();
        assert_eq!(paths.len(), 3, "{uri}");
        let p1 = paths.iter().find(|p| p.source_key == "p1").unwrap();
        let mut names: Vec<&str> = p1.entities.iter().map(|c| c.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["Acme", "Globex"], "{uri}");
        let p3 = paths.iter().find(|p| p.source_key == "p3").unwrap();
        assert!(p3.entities.is_empty(), "{uri}");
    }
}

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize, Deserialize)]
struct CustomerV2 {
    id: String,
    name: String,
    #[serde(default)]
    tier: String,
}

impl EntityType for CustomerV2 {
    const NAME: &'static str = "Customer";

    fn descriptor() -> TypeDescriptor {
        TypeDescriptor::entity("Customer")
            .primary_key("id")
            .field("name", TypeSpec::str())
            .field_with_default("tier", TypeSpec::str(), json!("standard"))
            .build()
            .expect("static descriptor")
    }

    fn key(&self) -> String {
        self.id.clone()
    }
}

#[test]
fn migration_with_upgrader_and_temporal_boundary() {
    for uri in backend_uris("migration") {
        // v1 world: two customers.
        let v1 = Session::new(&uri, options(&[Customer::descriptor()], &[])).unwrap();
        v1.ensure_entity(&Customer {
            id: "c1".into(),
            name: "Alice".into(),
        })
        .unwrap();
        v1.commit(None).unwrap();
        v1.ensure_entity(&Customer {
            id: "c2".into(),
            name: "Bob".into(),
        })
        .unwrap();
        v1.commit(None).unwrap();

        // v2 world: drift is detected.
        let v2 = Session::new(&uri, options(&[CustomerV2::descriptor()], &[])).unwrap();
        let err = v2.validate().unwrap_err();
        assert!(err.is_schema_outdated(), "{uri}");

        // Preview reports the upgrade work and hands out a token.
        let report = v2.migrate(MigrationRequest::preview()).unwrap();
        assert!(report.preview.has_changes, "{uri}");
        assert_eq!(report.preview.estimated_rows, 2, "{uri}");
        assert_eq!(
            report.preview.types_requiring_upgraders,
            vec!["Customer".to_string()],
            "{uri}"
        );
        assert_eq!(
            report.preview.missing_upgraders,
            vec![("Customer".to_string(), 1)],
            "{uri}"
        );
        let token = report.preview.token.clone().unwrap();

        // A wrong token is rejected.
        let mut upgraders = UpgraderSet::new();
        upgraders.register("Customer", 1, |mut payload| {
            let obj = payload.as_object_mut().expect("object payload");
            obj.insert("tier".into(), json!("legacy"));
            Ok(payload)
        });
        let err = v2
            .migrate(MigrationRequest::apply("bogus").with_upgraders(&upgraders))
            .unwrap_err();
        assert!(matches!(err, EngineError::MigrationToken { .. }), "{uri}");

        // Applying without the upgrader fails.
        let err = v2
            .migrate(MigrationRequest::apply(token.clone()))
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingUpgrader { .. }), "{uri}");

        // Apply for real.
        let report = v2
            .migrate(MigrationRequest::apply(token).with_upgraders(&upgraders))
            .unwrap();
        assert!(report.applied, "{uri}");
        let migration_commit = report.commit_id.unwrap();
        assert_eq!(migration_commit, 3, "{uri}");

        // Re-preview immediately after: nothing left to do.
        let report = v2.migrate(MigrationRequest::preview()).unwrap();
        assert!(!report.preview.has_changes, "{uri}");

        // Current state is the upgraded v2 shape.
        let query = v2.query().unwrap();
        let mut rows = query.entities::<CustomerV2>().unwrap().collect().unwrap();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(rows.len(), 2, "{uri}");
        assert_eq!(rows[0].tier, "legacy", "{uri}");

        // As-of before the activation commit is empty with a diagnostic;
        // as-of at/after it sees the v2 state.
        let query = v2.query().unwrap();
        let before = query
            .entities::<CustomerV2>()
            .unwrap()
            .as_of(migration_commit - 1)
            .collect()
            .unwrap();
        assert!(before.is_empty(), "{uri}");
        let query = v2.query().unwrap();
        let after = query
            .entities::<CustomerV2>()
            .unwrap()
            .as_of(migration_commit)
            .collect()
            .unwrap();
        assert_eq!(after.len(), 2, "{uri}");
    }
}

#[test]
fn schema_only_migration_needs_no_upgraders() {
    for uri in backend_uris("schema-only") {
        // Register v1 but never write rows.
        let v1 = Session::new(&uri, options(&[Customer::descriptor()], &[])).unwrap();
        v1.validate().unwrap();

        let v2 = Session::new(&uri, options(&[CustomerV2::descriptor()], &[])).unwrap();
        let report = v2.migrate(MigrationRequest::preview()).unwrap();
        assert!(report.preview.has_changes, "{uri}");
        assert_eq!(
            report.preview.types_schema_only,
            vec!["Customer".to_string()],
            "{uri}"
        );
        assert!(report.preview.missing_upgraders.is_empty(), "{uri}");

        let token = report.preview.token.clone().unwrap();
        let report = v2.migrate(MigrationRequest::apply(token)).unwrap();
        assert!(report.applied, "{uri}");
        assert_eq!(report.commit_id, None, "{uri}");

        v2.validate().unwrap();
        v2.ensure_entity(&CustomerV2 {
            id: "c1".into(),
            name: "Alice".into(),
            tier: "gold".into(),
        })
        .unwrap();
        assert_eq!(v2.commit(None).unwrap(), Some(1), "{uri}");
    }
}

// ---------------------------------------------------------------------------
// Commit metadata & inspection
// ---------------------------------------------------------------------------

#[test]
fn instance_metadata_travels_with_commits() {
    for uri in backend_uris("metadata") {
        let mut opts = options(&[Customer::descriptor()], &[]);
        opts.instance_metadata = BTreeMap::from([("operator".to_string(), "tests".to_string())]);
        let session = Session::new(&uri, opts).unwrap();

        session
            .ensure_entity(&Customer {
                id: "c1".into(),
                name: "Alice".into(),
            })
            .unwrap();
        let cid = session.commit(None).unwrap().unwrap();

        let commit = session.get_commit(cid).unwrap().unwrap();
        assert_eq!(commit.metadata.get("operator").map(String::as_str), Some("tests"));
        assert_eq!(
            session.list_commits(10, None).unwrap().len(),
            1,
            "{uri}"
        );
        assert_eq!(session.list_commit_changes(cid).unwrap().len(), 1, "{uri}");
    }
}
