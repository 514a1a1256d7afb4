//! Predicate compilation to SQLite SQL.
//!
//! Paths resolve to identity columns, typed partition columns (engine v2)
//! or `json_extract` over `fields_json`. The output must agree with the
//! in-process evaluator; the parity suite in `tests/` pins both.

use ontic_core::descriptor::{RecordKind, TypeDescriptor};
use ontic_core::error::{EngineError, Result};
use ontic_core::filter::{CompareOp, Comparison, ExistsComparison, FieldPath, Filter, Operand, Scalar};

/// Compilation context for one table reference.
pub(crate) struct FilterContext<'a> {
    /// SQL alias of the scanned table.
    pub alias: &'a str,
    pub descriptor: &'a TypeDescriptor,
    /// Whether typed scalar columns exist on the aliased table (v2
    /// partition scans).
    pub typed_columns: bool,
}

/// Converts a predicate scalar to a bound parameter.
pub(crate) fn scalar_param(scalar: &Scalar) -> rusqlite::types::Value {
    match scalar {
        Scalar::Null => rusqlite::types::Value::Null,
        Scalar::Bool(b) => rusqlite::types::Value::Integer(i64::from(*b)),
        Scalar::Int(i) => rusqlite::types::Value::Integer(*i),
        Scalar::Float(f) => rusqlite::types::Value::Real(*f),
        Scalar::Str(s) => rusqlite::types::Value::Text(s.clone()),
    }
}

/// SQL expression addressing a field path.
pub(crate) fn field_expr(ctx: &FilterContext<'_>, path: &FieldPath) -> String {
    if path.is_root() {
        let head = path.head();
        // Identity fields live in dedicated columns on every layout.
        match ctx.descriptor.kind {
            RecordKind::Entity => {
                if ctx.descriptor.primary_key_field() == Some(head) {
                    return format!("{}.entity_key", ctx.alias);
                }
            }
            RecordKind::Relation => {
                if let Some(l) = &ctx.descriptor.left {
                    if l.key_field == head {
                        return format!("{}.left_key", ctx.alias);
                    }
                }
                if let Some(r) = &ctx.descriptor.right {
                    if r.key_field == head {
                        return format!("{}.right_key", ctx.alias);
                    }
                }
                if ctx.descriptor.instance_key_field() == Some(head) {
                    return format!("{}.instance_key", ctx.alias);
                }
            }
        }
        if ctx.typed_columns {
            let is_typed = ctx
                .descriptor
                .field(head)
                .and_then(|f| f.spec.scalar_column())
                .is_some();
            if is_typed {
                return format!("{}.\"{head}\"", ctx.alias);
            }
        }
    }
    format!(
        "json_extract({}.fields_json, '{}')",
        ctx.alias,
        path.json_path()
    )
}

/// Compiles a filter to a SQL condition, appending bound parameters.
pub(crate) fn compile_filter(
    ctx: &FilterContext<'_>,
    filter: &Filter,
    params: &mut Vec<rusqlite::types::Value>,
) -> Result<String> {
    match filter {
        Filter::Compare(c) => compile_comparison(ctx, c, params),
        Filter::Exists(e) => compile_exists(ctx, e, params),
        Filter::And(a, b) => Ok(format!(
            "({} AND {})",
            compile_filter(ctx, a, params)?,
            compile_filter(ctx, b, params)?
        )),
        Filter::Or(a, b) => Ok(format!(
            "({} OR {})",
            compile_filter(ctx, a, params)?,
            compile_filter(ctx, b, params)?
        )),
        Filter::Not(inner) => Ok(format!("(NOT {})", compile_filter(ctx, inner, params)?)),
        Filter::Invalid(message) => Err(EngineError::validation(message.clone())),
    }
}

fn compile_comparison(
    ctx: &FilterContext<'_>,
    c: &Comparison,
    params: &mut Vec<rusqlite::types::Value>,
) -> Result<String> {
    let expr = field_expr(ctx, &c.path);
    compile_op(&expr, c.op, &c.operand, params)
}

fn compile_exists(
    ctx: &FilterContext<'_>,
    e: &ExistsComparison,
    params: &mut Vec<rusqlite::types::Value>,
) -> Result<String> {
    // The list is always addressed through fields_json: list fields are
    // never classified as typed columns.
    let list_expr = format!(
        "json_extract({}.fields_json, '{}')",
        ctx.alias,
        e.list_path.json_path()
    );
    let item_expr = match &e.item_path {
        Some(path) => format!("json_extract(je.value, '{}')", path.json_path()),
        None => "je.value".to_string(),
    };
    let inner = compile_op(&item_expr, e.op, &e.operand, params)?;
    // The json_type guard makes null and non-list values yield false,
    // matching the evaluator.
    Ok(format!(
        "(json_type({list_expr}) = 'array' AND EXISTS (SELECT 1 FROM json_each({list_expr}) AS je WHERE {inner}))"
    ))
}

fn compile_op(
    expr: &str,
    op: CompareOp,
    operand: &Operand,
    params: &mut Vec<rusqlite::types::Value>,
) -> Result<String> {
    match op {
        CompareOp::Eq
        | CompareOp::Ne
        | CompareOp::Gt
        | CompareOp::Ge
        | CompareOp::Lt
        | CompareOp::Le => {
            let Operand::Scalar(scalar) = operand else {
                return Err(EngineError::validation(format!(
                    "{op:?} requires a scalar operand"
                )));
            };
            params.push(scalar_param(scalar));
            let sql_op = op.sql().expect("binary operator");
            Ok(format!("{expr} {sql_op} ?"))
        }
        CompareOp::In => {
            let Operand::List(items) = operand else {
                return Err(EngineError::validation("in_() requires a list operand"));
            };
            if items.is_empty() {
                // `x IN ()` is not valid SQL; an empty list never matches.
                return Ok("0".to_string());
            }
            let placeholders: Vec<&str> = items.iter().map(|_| "?").collect();
            for item in items {
                params.push(scalar_param(item));
            }
            Ok(format!("{expr} IN ({})", placeholders.join(", ")))
        }
        CompareOp::StartsWith => {
            let needle = string_operand(operand)?;
            params.push(rusqlite::types::Value::Integer(
                needle.chars().count() as i64
            ));
            params.push(rusqlite::types::Value::Text(needle));
            // substr comparison stays case-sensitive, unlike LIKE.
            Ok(format!("substr({expr}, 1, ?) = ?"))
        }
        CompareOp::EndsWith => {
            let needle = string_operand(operand)?;
            params.push(rusqlite::types::Value::Integer(
                needle.chars().count() as i64
            ));
            params.push(rusqlite::types::Value::Text(needle));
            Ok(format!("substr({expr}, -?) = ?"))
        }
        CompareOp::Contains => {
            let needle = string_operand(operand)?;
            params.push(rusqlite::types::Value::Text(needle));
            Ok(format!("instr({expr}, ?) > 0"))
        }
        CompareOp::IsNull => Ok(format!("{expr} IS NULL")),
        CompareOp::IsNotNull => Ok(format!("{expr} IS NOT NULL")),
        CompareOp::IsTrue => Ok(format!("{expr} = 1")),
        CompareOp::IsFalse => Ok(format!("{expr} = 0")),
    }
}

fn string_operand(operand: &Operand) -> Result<String> {
    match operand {
        Operand::Scalar(Scalar::Str(s)) => Ok(s.clone()),
        _ => Err(EngineError::validation(
            "string predicates require a string operand",
        )),
    }
}
