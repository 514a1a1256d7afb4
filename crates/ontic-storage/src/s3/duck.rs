//! DuckDB SQL generation for the columnar scan.
//!
//! The object-store backend's default path decodes parquet and evaluates
//! predicates in-process ([`crate::s3::scan`]); for large scans the same
//! request compiles to a DuckDB query over the resolved file list. SQL
//! generation is always built and tested; execution requires the
//! `duckdb` feature.

use ontic_core::descriptor::RecordKind;
use ontic_core::filter::{CompareOp, Comparison, ExistsComparison, Filter, Operand, Scalar};
use ontic_core::query::{QueryRequest, SortDir, TemporalMode};

fn quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn scalar_literal(scalar: &Scalar) -> String {
    match scalar {
        Scalar::Null => "NULL".to_string(),
        Scalar::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Str(s) => quote_str(s),
    }
}

fn field_expr(request: &QueryRequest, path: &ontic_core::filter::FieldPath) -> String {
    if path.is_root() {
        let head = path.head();
        let descriptor = &request.descriptor;
        let identity = match descriptor.kind {
            RecordKind::Entity => descriptor.primary_key_field() == Some(head),
            RecordKind::Relation => {
                descriptor.left.as_ref().is_some_and(|l| l.key_field == head)
                    || descriptor.right.as_ref().is_some_and(|r| r.key_field == head)
                    || descriptor.instance_key_field() == Some(head)
            }
        };
        if identity {
            let column = if descriptor.primary_key_field() == Some(head) {
                "entity_key"
            } else if descriptor.left.as_ref().is_some_and(|l| l.key_field == head) {
                "left_key"
            } else if descriptor.right.as_ref().is_some_and(|r| r.key_field == head) {
                "right_key"
            } else {
                "instance_key"
            };
            return column.to_string();
        }
        // Typed scalar columns exist in the parquet files.
        if descriptor
            .field(head)
            .and_then(|f| f.spec.scalar_column())
            .is_some()
        {
            return format!("\"{head}\"");
        }
    }
    format!("json_extract_string(fields_json, '{}')", path.json_path())
}

fn compile_op(expr: &str, op: CompareOp, operand: &Operand) -> String {
    match op {
        CompareOp::Eq | CompareOp::Ne | CompareOp::Gt | CompareOp::Ge | CompareOp::Lt
        | CompareOp::Le => {
            let Operand::Scalar(scalar) = operand else {
                return "FALSE".to_string();
            };
            format!("{expr} {} {}", op.sql().unwrap_or("="), scalar_literal(scalar))
        }
        CompareOp::In => match operand {
            Operand::List(items) if !items.is_empty() => {
                let rendered: Vec<String> = items.iter().map(scalar_literal).collect();
                format!("{expr} IN ({})", rendered.join(", "))
            }
            _ => "FALSE".to_string(),
        },
        CompareOp::StartsWith => match operand {
            Operand::Scalar(Scalar::Str(s)) => format!("starts_with({expr}, {})", quote_str(s)),
            _ => "FALSE".to_string(),
        },
        CompareOp::EndsWith => match operand {
            Operand::Scalar(Scalar::Str(s)) => format!("ends_with({expr}, {})", quote_str(s)),
            _ => "FALSE".to_string(),
        },
        CompareOp::Contains => match operand {
            Operand::Scalar(Scalar::Str(s)) => format!("contains({expr}, {})", quote_str(s)),
            _ => "FALSE".to_string(),
        },
        CompareOp::IsNull => format!("{expr} IS NULL"),
        CompareOp::IsNotNull => format!("{expr} IS NOT NULL"),
        CompareOp::IsTrue => format!("{expr} = TRUE"),
        CompareOp::IsFalse => format!("{expr} = FALSE"),
    }
}

fn compile_comparison(request: &QueryRequest, c: &Comparison) -> String {
    compile_op(&field_expr(request, &c.path), c.op, &c.operand)
}

fn compile_exists(request: &QueryRequest, e: &ExistsComparison) -> String {
    let list_expr = format!("json_extract(fields_json, '{}')", e.list_path.json_path());
    let item_expr = match &e.item_path {
        Some(path) => format!("json_extract_string(je.value, '{}')", path.json_path()),
        None => "je.value ->> '$'".to_string(),
    };
    let inner = compile_op(&item_expr, e.op, &e.operand);
    format!(
        "(json_type({list_expr}) = 'ARRAY' AND EXISTS \
         (SELECT 1 FROM (SELECT unnest(json_extract({list_expr}, '$[*]')) AS value) je WHERE {inner}))"
    )
}

fn compile_filter(request: &QueryRequest, filter: &Filter) -> String {
    match filter {
        Filter::Compare(c) => compile_comparison(request, c),
        Filter::Exists(e) => compile_exists(request, e),
        Filter::And(a, b) => format!(
            "({} AND {})",
            compile_filter(request, a),
            compile_filter(request, b)
        ),
        Filter::Or(a, b) => format!(
            "({} OR {})",
            compile_filter(request, a),
            compile_filter(request, b)
        ),
        Filter::Not(inner) => format!("(NOT {})", compile_filter(request, inner)),
        Filter::Invalid(_) => "FALSE".to_string(),
    }
}

/// Generates the DuckDB scan query for a resolved file list.
pub(crate) fn sql_for_scan(files: &[String], request: &QueryRequest) -> String {
    let file_list: Vec<String> = files.iter().map(|f| quote_str(f)).collect();
    let type_col = match request.kind {
        RecordKind::Entity => "entity_type",
        RecordKind::Relation => "relation_type",
    };
    let partition = match request.kind {
        RecordKind::Entity => "entity_key".to_string(),
        RecordKind::Relation => "left_key, right_key, instance_key".to_string(),
    };

    let mut window_conditions = vec![
        format!("{type_col} = {}", quote_str(&request.type_name)),
        format!("schema_version_id = {}", request.schema_version),
    ];
    match request.temporal {
        TemporalMode::AsOf(c) => window_conditions.push(format!("commit_id <= {c}")),
        TemporalMode::HistorySince(c) => window_conditions.push(format!("commit_id > {c}")),
        TemporalMode::Latest | TemporalMode::WithHistory => {}
    }

    let base = format!(
        "SELECT *, ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY commit_id DESC) AS rn \
         FROM read_parquet([{}], union_by_name=true) WHERE {}",
        file_list.join(", "),
        window_conditions.join(" AND ")
    );

    let mut outer_conditions = Vec::new();
    if request.temporal.deduplicates() {
        outer_conditions.push("rn = 1".to_string());
    }
    if let Some(filter) = &request.filter {
        outer_conditions.push(compile_filter(request, filter));
    }
    let where_sql = if outer_conditions.is_empty() {
        "TRUE".to_string()
    } else {
        outer_conditions.join(" AND ")
    };

    let mut order_parts = Vec::new();
    if let Some((path, dir)) = &request.order_by {
        let dir = match dir {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        };
        order_parts.push(format!("{} {dir}", field_expr(request, path)));
    }
    if !request.temporal.deduplicates() {
        order_parts.push("commit_id ASC".to_string());
    }
    order_parts.push(partition.clone());

    let mut sql = format!(
        "SELECT * FROM ({base}) WHERE {where_sql} ORDER BY {}",
        order_parts.join(", ")
    );
    if let Some(limit) = request.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if let Some(offset) = request.offset {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
    sql
}

/// Executes the generated scan through an in-process DuckDB connection.
#[cfg(feature = "duckdb")]
pub(crate) fn run_scan(
    files: &[String],
    request: &QueryRequest,
    memory_limit: Option<&str>,
) -> ontic_core::error::Result<Vec<ontic_core::row::StoredRow>> {
    use ontic_core::error::EngineError;
    use ontic_core::identity::Identity;
    use ontic_core::row::StoredRow;

    let conn = duckdb::Connection::open_in_memory()
        .map_err(|e| EngineError::storage(format!("duckdb open failed: {e}")))?;
    if let Some(limit) = memory_limit {
        conn.execute_batch(&format!("SET memory_limit = {}", quote_str(limit)))
            .map_err(|e| EngineError::storage(format!("duckdb configure failed: {e}")))?;
    }
    let sql = sql_for_scan(files, request);
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| EngineError::storage(format!("duckdb prepare failed: {e}")))?;

    let kind = request.kind;
    let mut rows_out = Vec::new();
    let mut rows = stmt
        .query([])
        .map_err(|e| EngineError::storage(format!("duckdb query failed: {e}")))?;
    while let Some(row) = rows
        .next()
        .map_err(|e| EngineError::storage(format!("duckdb scan failed: {e}")))?
    {
        let commit_id: i64 = row.get("commit_id").unwrap_or_default();
        let version: i64 = row.get("schema_version_id").unwrap_or_default();
        let fields_json: String = row.get("fields_json").unwrap_or_default();
        let identity = match kind {
            RecordKind::Entity => Identity::Entity {
                key: row.get("entity_key").unwrap_or_default(),
            },
            RecordKind::Relation => Identity::Relation {
                left_key: row.get("left_key").unwrap_or_default(),
                right_key: row.get("right_key").unwrap_or_default(),
                instance_key: row.get("instance_key").unwrap_or_default(),
            },
        };
        rows_out.push(StoredRow {
            kind,
            type_name: request.type_name.clone(),
            identity,
            fields: serde_json::from_str(&fields_json)?,
            commit_id: commit_id as u64,
            schema_version_id: version,
        });
    }
    Ok(rows_out)
}
