//! Query execution over the history tables and v2 partitions.

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::debug;

use ontic_core::descriptor::RecordKind;
use ontic_core::error::{EngineError, Result};
use ontic_core::filter::FieldPath;
use ontic_core::identity::Identity;
use ontic_core::query::{
    AggFunc, AggregateCall, EndpointSide, GroupByRequest, GroupRow, QueryRequest, SortDir,
    TemporalMode,
};
use ontic_core::row::StoredRow;

use crate::sqlite::compile::{FilterContext, compile_filter, field_expr, scalar_param};
use crate::sqlite::layout::partition_table_name;
use crate::sqlite::store::{SqliteRepository, db_err};

/// An assembled scan: FROM/WHERE fragments plus parameters, against
/// either a history table or a v2 partition.
struct Scan {
    alias: &'static str,
    table: String,
    conditions: Vec<String>,
    params: Vec<rusqlite::types::Value>,
    /// Whether typed scalar columns exist on the scanned table.
    partition: bool,
}

impl SqliteRepository {
    /// Whether a latest-mode request can use the current v2 partition.
    fn partition_for(&self, conn: &Connection, request: &QueryRequest) -> Result<Option<String>> {
        if self.engine != ontic_core::config::EngineVersion::V2
            || request.temporal != TemporalMode::Latest
        {
            return Ok(None);
        }
        let current: Option<i64> = conn
            .query_row(
                "SELECT schema_version_id FROM type_layout_catalog WHERE kind = ?1 AND name = ?2",
                params![request.kind.as_str(), request.type_name],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| db_err("layout catalog read failed", e))?;
        if current == Some(request.schema_version) {
            Ok(Some(partition_table_name(
                request.kind,
                &request.type_name,
                request.schema_version,
            )))
        } else {
            Ok(None)
        }
    }

    /// Returns `true` when an `as_of` query predates the current schema
    /// version's activation commit and must come back empty.
    fn before_activation(&self, request: &QueryRequest) -> Result<bool> {
        let TemporalMode::AsOf(as_of) = request.temporal else {
            return Ok(false);
        };
        let activation = self
            .activation_commit_impl(request.kind, &request.type_name, request.schema_version)?
            .unwrap_or(0);
        if as_of < activation {
            debug!(
                type_name = %request.type_name,
                as_of,
                activation,
                "commit_before_activation: as_of precedes current schema version"
            );
            return Ok(true);
        }
        Ok(false)
    }

    fn build_scan(&self, conn: &Connection, request: &QueryRequest) -> Result<Scan> {
        let partition = self.partition_for(conn, request)?;
        let mut scan = match partition {
            Some(table) => Scan {
                alias: "h",
                table,
                conditions: Vec::new(),
                params: Vec::new(),
                partition: true,
            },
            None => {
                let table = match request.kind {
                    RecordKind::Entity => "entity_history",
                    RecordKind::Relation => "relation_history",
                };
                let type_col = match request.kind {
                    RecordKind::Entity => "entity_type",
                    RecordKind::Relation => "relation_type",
                };
                let mut scan = Scan {
                    alias: "h",
                    table: table.to_string(),
                    conditions: vec![
                        format!("h.{type_col} = ?"),
                        "h.schema_version_id = ?".to_string(),
                    ],
                    params: vec![
                        rusqlite::types::Value::Text(request.type_name.clone()),
                        rusqlite::types::Value::Integer(request.schema_version),
                    ],
                    partition: false,
                };
                self.apply_temporal(&mut scan, request);
                scan
            }
        };

        if let Some(filter) = &request.filter {
            let ctx = FilterContext {
                alias: scan.alias,
                descriptor: &request.descriptor,
                typed_columns: scan.partition,
            };
            let sql = compile_filter(&ctx, filter, &mut scan.params)?;
            scan.conditions.push(sql);
        }

        for endpoint in &request.endpoint_filters {
            let sql = self.compile_endpoint_filter(request, endpoint, &mut scan.params)?;
            scan.conditions.push(sql);
        }

        Ok(scan)
    }

    fn apply_temporal(&self, scan: &mut Scan, request: &QueryRequest) {
        let identity_cols: &[&str] = match request.kind {
            RecordKind::Entity => &["entity_type", "entity_key"],
            RecordKind::Relation => &["relation_type", "left_key", "right_key", "instance_key"],
        };
        let window_end = match request.temporal {
            TemporalMode::AsOf(c) => Some(c),
            _ => None,
        };
        if let Some(end) = window_end {
            scan.conditions.push("h.commit_id <= ?".to_string());
            scan.params
                .push(rusqlite::types::Value::Integer(end as i64));
        }
        if let TemporalMode::HistorySince(c) = request.temporal {
            scan.conditions.push("h.commit_id > ?".to_string());
            scan.params.push(rusqlite::types::Value::Integer(c as i64));
        }
        if request.temporal.deduplicates() {
            let matches: Vec<String> = identity_cols
                .iter()
                .map(|c| format!("h2.{c} = h.{c}"))
                .collect();
            let mut inner = format!(
                "h.commit_id = (SELECT MAX(h2.commit_id) FROM {} h2 WHERE {} AND h2.schema_version_id = ?",
                scan.table,
                matches.join(" AND ")
            );
            scan.params
                .push(rusqlite::types::Value::Integer(request.schema_version));
            if let Some(end) = window_end {
                inner.push_str(" AND h2.commit_id <= ?");
                scan.params
                    .push(rusqlite::types::Value::Integer(end as i64));
            }
            inner.push(')');
            scan.conditions.push(inner);
        }
    }

    /// Endpoint predicates become EXISTS subqueries over the endpoint
    /// entity's current state under the outer temporal mode.
    fn compile_endpoint_filter(
        &self,
        request: &QueryRequest,
        endpoint: &ontic_core::query::EndpointFilter,
        params_out: &mut Vec<rusqlite::types::Value>,
    ) -> Result<String> {
        if request.kind != RecordKind::Relation {
            return Err(EngineError::validation(
                "endpoint predicates require a relation query",
            ));
        }
        let (descriptor, version, join_col) = match endpoint.side {
            EndpointSide::Left => (
                request.left_descriptor.as_ref(),
                request.left_schema_version,
                "left_key",
            ),
            EndpointSide::Right => (
                request.right_descriptor.as_ref(),
                request.right_schema_version,
                "right_key",
            ),
        };
        let descriptor = descriptor.ok_or_else(|| {
            EngineError::validation("endpoint predicate without endpoint descriptor")
        })?;
        let version = version.ok_or_else(|| {
            EngineError::metadata(format!(
                "no current schema version for endpoint type {}",
                descriptor.name
            ))
        })?;

        let mut conditions = vec![
            "e.entity_type = ?".to_string(),
            format!("e.entity_key = h.{join_col}"),
            "e.schema_version_id = ?".to_string(),
        ];
        params_out.push(rusqlite::types::Value::Text(descriptor.name.clone()));
        params_out.push(rusqlite::types::Value::Integer(version));

        let window_end = match request.temporal {
            TemporalMode::AsOf(c) => Some(c),
            _ => None,
        };
        if let Some(end) = window_end {
            conditions.push("e.commit_id <= ?".to_string());
            params_out.push(rusqlite::types::Value::Integer(end as i64));
        }
        let mut dedup = String::from(
            "e.commit_id = (SELECT MAX(e2.commit_id) FROM entity_history e2
             WHERE e2.entity_type = e.entity_type AND e2.entity_key = e.entity_key
               AND e2.schema_version_id = ?",
        );
        params_out.push(rusqlite::types::Value::Integer(version));
        if let Some(end) = window_end {
            dedup.push_str(" AND e2.commit_id <= ?");
            params_out.push(rusqlite::types::Value::Integer(end as i64));
        }
        dedup.push(')');
        conditions.push(dedup);

        let ctx = FilterContext {
            alias: "e",
            descriptor,
            typed_columns: false,
        };
        conditions.push(compile_filter(&ctx, &endpoint.filter, params_out)?);

        Ok(format!(
            "EXISTS (SELECT 1 FROM entity_history e WHERE {})",
            conditions.join(" AND ")
        ))
    }

    fn order_sql(&self, request: &QueryRequest, scan: &Scan) -> String {
        let identity_order: &str = match request.kind {
            RecordKind::Entity => "h.entity_key ASC",
            RecordKind::Relation => "h.left_key ASC, h.right_key ASC, h.instance_key ASC",
        };
        let mut parts = Vec::new();
        if let Some((path, dir)) = &request.order_by {
            let ctx = FilterContext {
                alias: scan.alias,
                descriptor: &request.descriptor,
                typed_columns: scan.partition,
            };
            let dir = match dir {
                SortDir::Asc => "ASC",
                SortDir::Desc => "DESC",
            };
            parts.push(format!("{} {dir}", field_expr(&ctx, path)));
        }
        if !request.temporal.deduplicates() {
            parts.push("h.commit_id ASC".to_string());
        }
        parts.push(identity_order.to_string());
        format!("ORDER BY {}", parts.join(", "))
    }

    fn limit_sql(request: &QueryRequest, params: &mut Vec<rusqlite::types::Value>) -> String {
        let mut sql = String::new();
        if let Some(limit) = request.limit {
            sql.push_str(" LIMIT ?");
            params.push(rusqlite::types::Value::Integer(limit as i64));
            if let Some(offset) = request.offset {
                sql.push_str(" OFFSET ?");
                params.push(rusqlite::types::Value::Integer(offset as i64));
            }
        } else if let Some(offset) = request.offset {
            sql.push_str(" LIMIT -1 OFFSET ?");
            params.push(rusqlite::types::Value::Integer(offset as i64));
        }
        sql
    }

    pub(crate) fn query_rows_impl(&self, request: &QueryRequest) -> Result<Vec<StoredRow>> {
        if self.before_activation(request)? {
            return Ok(Vec::new());
        }
        let conn = self.lock_conn()?;
        let scan = self.build_scan(&conn, request)?;

        let select_cols = match (request.kind, scan.partition) {
            (RecordKind::Entity, _) => "h.entity_key, h.fields_json, h.commit_id, h.schema_version_id",
            (RecordKind::Relation, _) => {
                "h.left_key, h.right_key, h.instance_key, h.fields_json, h.commit_id, h.schema_version_id"
            }
        };
        let where_sql = if scan.conditions.is_empty() {
            "1".to_string()
        } else {
            scan.conditions.join(" AND ")
        };
        let order_sql = self.order_sql(request, &scan);
        let mut params_vec = scan.params;
        let limit_sql = Self::limit_sql(request, &mut params_vec);
        let sql = format!(
            "SELECT {select_cols} FROM {} h WHERE {where_sql} {order_sql}{limit_sql}",
            scan.table
        );
        debug!(%sql, "row query");

        let mut stmt = conn.prepare(&sql).map_err(|e| db_err("query prepare failed", e))?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> = params_vec
            .iter()
            .map(|p| p as &dyn rusqlite::types::ToSql)
            .collect();

        let mut out = Vec::new();
        match request.kind {
            RecordKind::Entity => {
                let rows = stmt
                    .query_map(param_refs.as_slice(), |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, i64>(2)?,
                            r.get::<_, i64>(3)?,
                        ))
                    })
                    .map_err(|e| db_err("query failed", e))?;
                for row in rows {
                    let (key, fields_json, commit_id, version) =
                        row.map_err(|e| db_err("row scan failed", e))?;
                    out.push(StoredRow {
                        kind: RecordKind::Entity,
                        type_name: request.type_name.clone(),
                        identity: Identity::Entity { key },
                        fields: serde_json::from_str(&fields_json)?,
                        commit_id: commit_id as u64,
                        schema_version_id: version,
                    });
                }
            }
            RecordKind::Relation => {
                let rows = stmt
                    .query_map(param_refs.as_slice(), |r| {
                        Ok((
                            r.get::<_, String>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, String>(2)?,
                            r.get::<_, String>(3)?,
                            r.get::<_, i64>(4)?,
                            r.get::<_, i64>(5)?,
                        ))
                    })
                    .map_err(|e| db_err("query failed", e))?;
                for row in rows {
                    let (left_key, right_key, instance_key, fields_json, commit_id, version) =
                        row.map_err(|e| db_err("row scan failed", e))?;
                    out.push(StoredRow {
                        kind: RecordKind::Relation,
                        type_name: request.type_name.clone(),
                        identity: Identity::Relation {
                            left_key,
                            right_key,
                            instance_key,
                        },
                        fields: serde_json::from_str(&fields_json)?,
                        commit_id: commit_id as u64,
                        schema_version_id: version,
                    });
                }
            }
        }
        Ok(out)
    }

    fn aggregate_expr(&self, request: &QueryRequest, scan: &Scan, call: &AggregateCall) -> Result<String> {
        let ctx = FilterContext {
            alias: scan.alias,
            descriptor: &request.descriptor,
            typed_columns: scan.partition,
        };
        let field_sql = |path: &Option<FieldPath>| -> Result<String> {
            let path = path.as_ref().ok_or_else(|| {
                EngineError::validation("aggregate requires a target field")
            })?;
            Ok(field_expr(&ctx, path))
        };
        Ok(match call.func {
            AggFunc::Count => "COUNT(*)".to_string(),
            AggFunc::Sum => format!("SUM({})", field_sql(&call.field)?),
            AggFunc::Avg => format!("AVG({})", field_sql(&call.field)?),
            AggFunc::Min => format!("MIN({})", field_sql(&call.field)?),
            AggFunc::Max => format!("MAX({})", field_sql(&call.field)?),
            AggFunc::AvgLen => {
                // List fields always live in fields_json.
                let path = call.field.as_ref().ok_or_else(|| {
                    EngineError::validation("avg_len requires a list field")
                })?;
                format!(
                    "AVG(json_array_length(json_extract({}.fields_json, '{}')))",
                    scan.alias,
                    path.json_path()
                )
            }
        })
    }

    pub(crate) fn aggregate_impl(
        &self,
        request: &QueryRequest,
        call: &AggregateCall,
    ) -> Result<Value> {
        if self.before_activation(request)? {
            return Ok(match call.func {
                AggFunc::Count => Value::from(0),
                _ => Value::Null,
            });
        }
        let conn = self.lock_conn()?;
        let scan = self.build_scan(&conn, request)?;
        let agg = self.aggregate_expr(request, &scan, call)?;
        let where_sql = if scan.conditions.is_empty() {
            "1".to_string()
        } else {
            scan.conditions.join(" AND ")
        };
        let sql = format!("SELECT {agg} FROM {} h WHERE {where_sql}", scan.table);
        debug!(%sql, "aggregate query");
        let param_refs: Vec<&dyn rusqlite::types::ToSql> = scan
            .params
            .iter()
            .map(|p| p as &dyn rusqlite::types::ToSql)
            .collect();
        let value: rusqlite::types::Value = conn
            .query_row(&sql, param_refs.as_slice(), |r| r.get(0))
            .map_err(|e| db_err("aggregate failed", e))?;
        Ok(sql_value_to_json(value))
    }

    pub(crate) fn group_aggregate_impl(
        &self,
        request: &QueryRequest,
        group: &GroupByRequest,
    ) -> Result<Vec<GroupRow>> {
        if self.before_activation(request)? {
            return Ok(Vec::new());
        }
        if group.keys.is_empty() {
            return Err(EngineError::validation("group_by requires at least one key"));
        }
        let conn = self.lock_conn()?;
        let mut scan = self.build_scan(&conn, request)?;
        let ctx = FilterContext {
            alias: scan.alias,
            descriptor: &request.descriptor,
            typed_columns: scan.partition,
        };

        let key_exprs: Vec<String> = group.keys.iter().map(|k| field_expr(&ctx, k)).collect();
        let mut agg_exprs = Vec::new();
        for (_, call) in &group.aggregates {
            agg_exprs.push(self.aggregate_expr(request, &scan, call)?);
        }

        let where_sql = if scan.conditions.is_empty() {
            "1".to_string()
        } else {
            scan.conditions.join(" AND ")
        };
        let mut sql = format!(
            "SELECT {}, {} FROM {} h WHERE {where_sql} GROUP BY {}",
            key_exprs.join(", "),
            if agg_exprs.is_empty() {
                "COUNT(*)".to_string()
            } else {
                agg_exprs.join(", ")
            },
            scan.table,
            key_exprs.join(", ")
        );
        if let Some(having) = &group.having {
            let idx = group
                .aggregates
                .iter()
                .position(|(name, _)| name == &having.aggregate)
                .ok_or_else(|| {
                    EngineError::validation(format!(
                        "having references unknown aggregate `{}`",
                        having.aggregate
                    ))
                })?;
            let op = having.op.sql().ok_or_else(|| {
                EngineError::validation("having supports scalar comparison operators only")
            })?;
            sql.push_str(&format!(" HAVING {} {op} ?", agg_exprs[idx]));
            scan.params.push(scalar_param(&having.value));
        }
        sql.push_str(&format!(" ORDER BY {}", key_exprs.join(", ")));
        debug!(%sql, "group aggregate query");

        let mut stmt = conn.prepare(&sql).map_err(|e| db_err("group prepare failed", e))?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> = scan
            .params
            .iter()
            .map(|p| p as &dyn rusqlite::types::ToSql)
            .collect();
        let key_count = group.keys.len();
        let agg_count = group.aggregates.len();
        let rows = stmt
            .query_map(param_refs.as_slice(), |r| {
                let mut values = Vec::with_capacity(key_count + agg_count);
                for i in 0..key_count + agg_count.max(1) {
                    values.push(r.get::<_, rusqlite::types::Value>(i)?);
                }
                Ok(values)
            })
            .map_err(|e| db_err("group query failed", e))?;

        let mut out = Vec::new();
        for row in rows {
            let values = row.map_err(|e| db_err("group scan failed", e))?;
            let keys = group
                .keys
                .iter()
                .zip(values.iter())
                .map(|(k, v)| (k.to_string(), sql_value_to_json(v.clone())))
                .collect();
            let aggregates = group
                .aggregates
                .iter()
                .zip(values.iter().skip(key_count))
                .map(|((name, _), v)| (name.clone(), sql_value_to_json(v.clone())))
                .collect();
            out.push(GroupRow { keys, aggregates });
        }
        Ok(out)
    }

    pub(crate) fn count_current_rows_impl(
        &self,
        kind: RecordKind,
        name: &str,
        version: i64,
    ) -> Result<u64> {
        let conn = self.lock_conn()?;
        let (table, identity_cols): (&str, &[&str]) = match kind {
            RecordKind::Entity => ("entity_history", &["entity_type", "entity_key"]),
            RecordKind::Relation => (
                "relation_history",
                &["relation_type", "left_key", "right_key", "instance_key"],
            ),
        };
        let type_col = identity_cols[0];
        let matches: Vec<String> = identity_cols
            .iter()
            .map(|c| format!("h2.{c} = h.{c}"))
            .collect();
        let sql = format!(
            "SELECT COUNT(*) FROM {table} h
             WHERE h.{type_col} = ?1 AND h.schema_version_id = ?2
               AND h.commit_id = (SELECT MAX(h2.commit_id) FROM {table} h2
                                  WHERE {} AND h2.schema_version_id = ?2)",
            matches.join(" AND ")
        );
        conn.query_row(&sql, params![name, version], |r| r.get::<_, i64>(0))
            .map(|v| v as u64)
            .map_err(|e| db_err("current row count failed", e))
    }
}

/// Converts a SQLite value to JSON.
pub(crate) fn sql_value_to_json(value: rusqlite::types::Value) -> Value {
    match value {
        rusqlite::types::Value::Null => Value::Null,
        rusqlite::types::Value::Integer(i) => Value::from(i),
        rusqlite::types::Value::Real(f) => Value::from(f),
        rusqlite::types::Value::Text(s) => Value::String(s),
        rusqlite::types::Value::Blob(_) => Value::Null,
    }
}
