//! In-process predicate evaluation.
//!
//! Shared by the object-store backend's non-SQL scan path and by handler
//! utilities. Semantics mirror the SQL compilation exactly, including
//! three-valued logic: a comparison against a missing or null field is
//! *unknown*, and a row matches only when the whole filter evaluates to
//! definitely-true. The parity test suite in `ontic-storage` pins this
//! module against the SQLite compiler.

use serde_json::Value;

use crate::filter::{CompareOp, Comparison, ExistsComparison, FieldPath, Filter, Operand, Scalar};

/// Returns `true` iff `row` (a merged identity+payload object) satisfies
/// the filter.
pub fn matches(filter: &Filter, row: &Value) -> bool {
    eval(filter, row) == Some(true)
}

/// Three-valued evaluation: `None` is SQL NULL/unknown.
pub fn eval(filter: &Filter, row: &Value) -> Option<bool> {
    match filter {
        Filter::Compare(c) => eval_comparison(c, row),
        Filter::Exists(e) => Some(eval_exists(e, row)),
        Filter::And(a, b) => and3(eval(a, row), eval(b, row)),
        Filter::Or(a, b) => or3(eval(a, row), eval(b, row)),
        Filter::Not(inner) => eval(inner, row).map(|v| !v),
        // Invalid filters are rejected at build time; nothing matches.
        Filter::Invalid(_) => Some(false),
    }
}

fn and3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(false), _) | (_, Some(false)) => Some(false),
        (Some(true), Some(true)) => Some(true),
        _ => None,
    }
}

fn or3(a: Option<bool>, b: Option<bool>) -> Option<bool> {
    match (a, b) {
        (Some(true), _) | (_, Some(true)) => Some(true),
        (Some(false), Some(false)) => Some(false),
        _ => None,
    }
}

/// Resolves a dot path inside a JSON object; missing keys resolve to null.
pub fn resolve<'a>(value: &'a Value, path: &FieldPath) -> &'a Value {
    resolve_segments(value, path.segments())
}

fn resolve_segments<'a>(value: &'a Value, segments: &[String]) -> &'a Value {
    let mut current = value;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
            _ => &Value::Null,
        };
    }
    current
}

fn eval_comparison(c: &Comparison, row: &Value) -> Option<bool> {
    let field = resolve(row, &c.path);
    apply_op(field, c.op, &c.operand)
}

fn eval_exists(e: &ExistsComparison, row: &Value) -> bool {
    let list = resolve(row, &e.list_path);
    let Value::Array(items) = list else {
        // Null lists and non-list values yield false.
        return false;
    };
    items.iter().any(|item| {
        let target = match &e.item_path {
            Some(path) => resolve_segments(item, path.segments()),
            None => item,
        };
        apply_op(target, e.op, &e.operand) == Some(true)
    })
}

fn apply_op(field: &Value, op: CompareOp, operand: &Operand) -> Option<bool> {
    match op {
        CompareOp::IsNull => Some(field.is_null()),
        CompareOp::IsNotNull => Some(!field.is_null()),
        CompareOp::IsTrue => eval_bool_test(field, true),
        CompareOp::IsFalse => eval_bool_test(field, false),
        CompareOp::Eq => eval_eq(field, operand),
        CompareOp::Ne => eval_eq(field, operand).map(|v| !v),
        CompareOp::Gt | CompareOp::Ge | CompareOp::Lt | CompareOp::Le => {
            eval_ordered(field, op, operand)
        }
        CompareOp::In => eval_in(field, operand),
        CompareOp::StartsWith | CompareOp::EndsWith | CompareOp::Contains => {
            eval_string_op(field, op, operand)
        }
    }
}

fn eval_bool_test(field: &Value, expected: bool) -> Option<bool> {
    // The SQL compilation is `json_extract(..) = 1` / `= 0`; JSON booleans
    // surface as integers there, so numeric 1/0 also match.
    match field {
        Value::Null => None,
        Value::Bool(b) => Some(*b == expected),
        Value::Number(n) => {
            let target = if expected { 1.0 } else { 0.0 };
            Some(n.as_f64() == Some(target))
        }
        _ => Some(false),
    }
}

fn eval_eq(field: &Value, operand: &Operand) -> Option<bool> {
    let Operand::Scalar(scalar) = operand else {
        return Some(false);
    };
    match field {
        Value::Null => None,
        _ => Some(scalar_eq(field, scalar)),
    }
}

fn scalar_eq(field: &Value, scalar: &Scalar) -> bool {
    match (field, scalar) {
        (Value::String(a), Scalar::Str(b)) => a == b,
        (Value::Number(a), Scalar::Int(b)) => a.as_f64() == Some(*b as f64),
        (Value::Number(a), Scalar::Float(b)) => a.as_f64() == Some(*b),
        (Value::Bool(a), Scalar::Bool(b)) => a == b,
        _ => false,
    }
}

fn eval_ordered(field: &Value, op: CompareOp, operand: &Operand) -> Option<bool> {
    let Operand::Scalar(scalar) = operand else {
        return Some(false);
    };
    if field.is_null() {
        return None;
    }
    let ordering = compare_values(field, scalar)?;
    Some(match op {
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        _ => unreachable!(),
    })
}

/// SQLite value ordering over JSON-extracted values: numbers (booleans
/// surface as integers) sort before text; within a class, natural order.
fn compare_values(field: &Value, scalar: &Scalar) -> Option<std::cmp::Ordering> {
    let field_num = match field {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    let scalar_num = match scalar {
        Scalar::Int(i) => Some(*i as f64),
        Scalar::Float(f) => Some(*f),
        Scalar::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    };
    match (field_num, scalar_num) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        (None, None) => match (field, scalar) {
            (Value::String(a), Scalar::Str(b)) => Some(a.as_str().cmp(b.as_str())),
            _ => None,
        },
        // Numbers sort before text in SQLite.
        (Some(_), None) => Some(std::cmp::Ordering::Less),
        (None, Some(_)) => Some(std::cmp::Ordering::Greater),
    }
}

fn eval_in(field: &Value, operand: &Operand) -> Option<bool> {
    let Operand::List(items) = operand else {
        return Some(false);
    };
    if field.is_null() {
        // `NULL IN (..)` is unknown; `x IN ()` is false either way.
        return if items.is_empty() { Some(false) } else { None };
    }
    Some(items.iter().any(|s| scalar_eq(field, s)))
}

fn eval_string_op(field: &Value, op: CompareOp, operand: &Operand) -> Option<bool> {
    let Operand::Scalar(Scalar::Str(needle)) = operand else {
        return Some(false);
    };
    match field {
        Value::Null => None,
        Value::String(s) => Some(match op {
            CompareOp::StartsWith => s.starts_with(needle),
            CompareOp::EndsWith => s.ends_with(needle),
            CompareOp::Contains => s.contains(needle),
            _ => unreachable!(),
        }),
        _ => Some(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compare(path: &str, op: CompareOp, operand: Operand) -> Filter {
        Filter::Compare(Comparison {
            path: FieldPath::parse(path).unwrap(),
            op,
            operand,
        })
    }

    fn exists(list: &str, item: Option<&str>, op: CompareOp, operand: Operand) -> Filter {
        Filter::Exists(ExistsComparison {
            list_path: FieldPath::parse(list).unwrap(),
            item_path: item.map(|p| FieldPath::parse(p).unwrap()),
            op,
            operand,
        })
    }

    #[test]
    fn missing_keys_resolve_to_null() {
        let row = json!({ "a": 1 });
        let f = compare("b", CompareOp::Eq, Operand::Scalar(Scalar::Int(1)));
        assert!(!matches(&f, &row));
        let f = compare("b", CompareOp::IsNull, Operand::None);
        assert!(matches(&f, &row));
    }

    #[test]
    fn nested_path_resolution() {
        let row = json!({ "a": { "b": { "c": "deep" } } });
        let f = compare("a.b.c", CompareOp::Eq, Operand::Scalar("deep".into()));
        assert!(matches(&f, &row));
    }

    #[test]
    fn ne_on_null_field_is_unknown() {
        // Mirrors SQL: NULL <> 'x' is NULL, so the row does not match.
        let row = json!({ "name": null });
        let f = compare("name", CompareOp::Ne, Operand::Scalar("x".into()));
        assert!(!matches(&f, &row));
        // And NOT of unknown stays unknown.
        assert!(!matches(&!f, &row));
    }

    #[test]
    fn numeric_cross_type_equality() {
        let row = json!({ "n": 1 });
        assert!(matches(
            &compare("n", CompareOp::Eq, Operand::Scalar(Scalar::Float(1.0))),
            &row
        ));
    }

    #[test]
    fn ordered_comparisons() {
        let row = json!({ "age": 30, "name": "bob" });
        assert!(matches(
            &compare("age", CompareOp::Gt, Operand::Scalar(Scalar::Int(18))),
            &row
        ));
        assert!(matches(
            &compare("name", CompareOp::Ge, Operand::Scalar("alice".into())),
            &row
        ));
        // Numbers sort before text.
        assert!(matches(
            &compare("age", CompareOp::Lt, Operand::Scalar("zzz".into())),
            &row
        ));
    }

    #[test]
    fn in_empty_list_is_always_false() {
        let row = json!({ "name": "a" });
        let f = compare("name", CompareOp::In, Operand::List(vec![]));
        assert!(!matches(&f, &row));
        let row = json!({ "name": null });
        assert!(!matches(&f, &row));
    }

    #[test]
    fn exists_over_null_or_empty_list_is_false() {
        let f = exists(
            "tags",
            None,
            CompareOp::Eq,
            Operand::Scalar("rust".into()),
        );
        assert!(!matches(&f, &json!({ "tags": null })));
        assert!(!matches(&f, &json!({ "tags": [] })));
        assert!(!matches(&f, &json!({ "tags": "not-a-list" })));
        assert!(!matches(&f, &json!({})));
    }

    #[test]
    fn exists_with_item_path() {
        let row = json!({ "orders": [ { "total": 5 }, { "total": 50 } ] });
        let f = exists(
            "orders",
            Some("total"),
            CompareOp::Gt,
            Operand::Scalar(Scalar::Int(10)),
        );
        assert!(matches(&f, &row));
        let f = exists(
            "orders",
            Some("total"),
            CompareOp::Gt,
            Operand::Scalar(Scalar::Int(100)),
        );
        assert!(!matches(&f, &row));
    }

    #[test]
    fn string_predicates() {
        let row = json!({ "email": "alice@example.com" });
        assert!(matches(
            &compare(
                "email",
                CompareOp::EndsWith,
                Operand::Scalar("@example.com".into())
            ),
            &row
        ));
        assert!(matches(
            &compare("email", CompareOp::StartsWith, Operand::Scalar("alice".into())),
            &row
        ));
        assert!(matches(
            &compare("email", CompareOp::Contains, Operand::Scalar("@".into())),
            &row
        ));
    }

    #[test]
    fn boolean_tests() {
        let row = json!({ "active": true, "archived": false });
        assert!(matches(
            &compare("active", CompareOp::IsTrue, Operand::None),
            &row
        ));
        assert!(matches(
            &compare("archived", CompareOp::IsFalse, Operand::None),
            &row
        ));
        assert!(!matches(
            &compare("missing", CompareOp::IsTrue, Operand::None),
            &row
        ));
    }

    #[test]
    fn kleene_composition() {
        let row = json!({ "a": 1, "b": null });
        let known = compare("a", CompareOp::Eq, Operand::Scalar(Scalar::Int(1)));
        let unknown = compare("b", CompareOp::Eq, Operand::Scalar(Scalar::Int(2)));
        // true OR unknown = true
        assert!(matches(&(known.clone() | unknown.clone()), &row));
        // true AND unknown = unknown
        assert!(!matches(&(known & unknown), &row));
    }
}
