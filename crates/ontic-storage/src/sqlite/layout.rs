//! Engine v2 typed partitions.
//!
//! v2 stores, in addition to the shared history tables, one data table
//! per `(type, schema_version_id)` holding the *current* row per identity
//! with typed columns for scalar fields. Latest-state reads consult the
//! current partition; temporal reads stay on the history tables.

use rusqlite::Connection;
use serde_json::Value;

use ontic_core::descriptor::{RecordKind, TypeDescriptor};
use ontic_core::error::Result;
use ontic_core::identity::Identity;
use ontic_core::spec::Primitive;

/// Columns that can never be shadowed by a payload field.
const RESERVED_COLUMNS: &[&str] = &[
    "entity_key",
    "left_key",
    "right_key",
    "instance_key",
    "commit_id",
    "schema_version_id",
    "fields_json",
];

/// Partition table name for a `(kind, type, version)`.
pub(crate) fn partition_table_name(kind: RecordKind, name: &str, version: i64) -> String {
    format!("{}_{}_v{}", kind.as_str(), name, version)
}

/// Payload fields classified as typed scalar columns.
pub(crate) fn typed_columns(descriptor: &TypeDescriptor) -> Vec<(String, Primitive)> {
    descriptor
        .payload_fields()
        .filter(|f| !RESERVED_COLUMNS.contains(&f.name.as_str()))
        .filter_map(|f| f.spec.scalar_column().map(|p| (f.name.clone(), p)))
        .collect()
}

fn sql_type(primitive: Primitive) -> &'static str {
    match primitive {
        Primitive::Int | Primitive::Bool => "INTEGER",
        Primitive::Float => "REAL",
        Primitive::Str | Primitive::Datetime | Primitive::Null => "TEXT",
    }
}

/// DDL creating a partition table (plus indexes for `index` fields).
pub(crate) fn partition_ddl(descriptor: &TypeDescriptor, version: i64) -> Vec<String> {
    let table = partition_table_name(descriptor.kind, &descriptor.name, version);
    let mut columns = Vec::new();
    match descriptor.kind {
        RecordKind::Entity => {
            columns.push("entity_key TEXT PRIMARY KEY".to_string());
        }
        RecordKind::Relation => {
            columns.push("left_key TEXT NOT NULL".to_string());
            columns.push("right_key TEXT NOT NULL".to_string());
            columns.push("instance_key TEXT NOT NULL DEFAULT ''".to_string());
        }
    }
    columns.push("commit_id INTEGER NOT NULL".to_string());
    columns.push("schema_version_id INTEGER NOT NULL".to_string());
    columns.push("fields_json TEXT NOT NULL DEFAULT '{}'".to_string());
    for (name, primitive) in typed_columns(descriptor) {
        columns.push(format!("\"{name}\" {}", sql_type(primitive)));
    }
    if descriptor.kind == RecordKind::Relation {
        columns.push("PRIMARY KEY (left_key, right_key, instance_key)".to_string());
    }

    let mut statements = vec![format!(
        "CREATE TABLE IF NOT EXISTS {table} ({})",
        columns.join(", ")
    )];
    for field in descriptor.payload_fields().filter(|f| f.index) {
        if typed_columns(descriptor).iter().any(|(n, _)| n == &field.name) {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{field} ON {table}(\"{field}\")",
                field = field.name
            ));
        }
    }
    statements
}

/// Converts a payload field to a typed-column parameter.
fn column_param(payload: &Value, name: &str) -> rusqlite::types::Value {
    match payload.get(name) {
        None | Some(Value::Null) => rusqlite::types::Value::Null,
        Some(Value::Bool(b)) => rusqlite::types::Value::Integer(i64::from(*b)),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or_default())
            }
        }
        Some(Value::String(s)) => rusqlite::types::Value::Text(s.clone()),
        Some(other) => rusqlite::types::Value::Text(other.to_string()),
    }
}

/// Upserts the current row for an identity into its partition.
pub(crate) fn upsert_partition_row(
    conn: &Connection,
    descriptor: &TypeDescriptor,
    version: i64,
    identity: &Identity,
    fields_json: &str,
    payload: &Value,
    commit_id: u64,
) -> Result<()> {
    let table = partition_table_name(descriptor.kind, &descriptor.name, version);
    let typed = typed_columns(descriptor);

    let mut columns: Vec<String> = Vec::new();
    let mut params: Vec<rusqlite::types::Value> = Vec::new();
    match identity {
        Identity::Entity { key } => {
            columns.push("entity_key".into());
            params.push(rusqlite::types::Value::Text(key.clone()));
        }
        Identity::Relation {
            left_key,
            right_key,
            instance_key,
        } => {
            columns.push("left_key".into());
            params.push(rusqlite::types::Value::Text(left_key.clone()));
            columns.push("right_key".into());
            params.push(rusqlite::types::Value::Text(right_key.clone()));
            columns.push("instance_key".into());
            params.push(rusqlite::types::Value::Text(instance_key.clone()));
        }
    }
    columns.push("commit_id".into());
    params.push(rusqlite::types::Value::Integer(commit_id as i64));
    columns.push("schema_version_id".into());
    params.push(rusqlite::types::Value::Integer(version));
    columns.push("fields_json".into());
    params.push(rusqlite::types::Value::Text(fields_json.to_string()));
    for (name, _) in &typed {
        columns.push(format!("\"{name}\""));
        params.push(column_param(payload, name));
    }

    let conflict_target = match descriptor.kind {
        RecordKind::Entity => "entity_key",
        RecordKind::Relation => "left_key, right_key, instance_key",
    };
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| {
            !matches!(
                c.as_str(),
                "entity_key" | "left_key" | "right_key" | "instance_key"
            )
        })
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("?{i}")).collect();

    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT({conflict_target}) DO UPDATE SET {}",
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    );
    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        params.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();
    conn.execute(&sql, param_refs.as_slice())
        .map_err(|e| ontic_core::error::EngineError::storage(format!(
            "partition upsert into {table} failed: {e}"
        )))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontic_core::spec::TypeSpec;
    use serde_json::json;

    fn customer() -> TypeDescriptor {
        TypeDescriptor::entity("Customer")
            .primary_key("id")
            .indexed_field("name", TypeSpec::str())
            .field("age", TypeSpec::optional(TypeSpec::int()))
            .field("tags", TypeSpec::list(TypeSpec::str()))
            .build()
            .unwrap()
    }

    #[test]
    fn scalar_fields_become_typed_columns() {
        let cols = typed_columns(&customer());
        let names: Vec<&str> = cols.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["name", "age"]);
    }

    #[test]
    fn ddl_creates_table_and_index() {
        let ddl = partition_ddl(&customer(), 1);
        assert!(ddl[0].contains("entity_Customer_v1"));
        assert!(ddl[0].contains("\"name\" TEXT"));
        assert!(ddl[0].contains("\"age\" INTEGER"));
        // Lists stay in fields_json.
        assert!(!ddl[0].contains("\"tags\""));
        assert!(ddl.iter().any(|s| s.contains("CREATE INDEX")));
    }

    #[test]
    fn upsert_replaces_current_row() {
        let conn = Connection::open_in_memory().unwrap();
        let desc = customer();
        for stmt in partition_ddl(&desc, 1) {
            conn.execute_batch(&stmt).unwrap();
        }
        let identity = Identity::Entity { key: "c1".into() };
        let payload = json!({ "name": "Alice", "age": 30, "tags": [] });
        upsert_partition_row(&conn, &desc, 1, &identity, &payload.to_string(), &payload, 1)
            .unwrap();
        let payload2 = json!({ "name": "Alice2", "age": 31, "tags": [] });
        upsert_partition_row(&conn, &desc, 1, &identity, &payload2.to_string(), &payload2, 2)
            .unwrap();

        let (count, name, commit): (i64, String, i64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(\"name\"), MAX(commit_id) FROM entity_Customer_v1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(name, "Alice2");
        assert_eq!(commit, 2);
    }
}
