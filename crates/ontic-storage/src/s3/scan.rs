//! In-process query execution over decoded rows.
//!
//! The object-store backend's default scan path: temporal windowing,
//! per-identity dedup, predicate evaluation through the shared evaluator,
//! ordering, paging and aggregation, all with the same semantics the
//! SQLite compiler produces. The parity suite pins the two together.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;

use ontic_core::descriptor::TypeDescriptor;
use ontic_core::error::{EngineError, Result};
use ontic_core::eval;
use ontic_core::filter::{Comparison, FieldPath, Filter, Operand};
use ontic_core::identity::Identity;
use ontic_core::query::{
    AggFunc, AggregateCall, GroupByRequest, GroupRow, QueryRequest, SortDir, TemporalMode,
};
use ontic_core::row::StoredRow;

/// Applies the temporal window and (for dedup modes) keeps the latest row
/// per identity. Rows must already be scoped to one schema version.
pub(crate) fn apply_temporal(rows: Vec<StoredRow>, temporal: TemporalMode) -> Vec<StoredRow> {
    let windowed: Vec<StoredRow> = rows
        .into_iter()
        .filter(|r| match temporal {
            TemporalMode::Latest | TemporalMode::WithHistory => true,
            TemporalMode::AsOf(c) => r.commit_id <= c,
            TemporalMode::HistorySince(c) => r.commit_id > c,
        })
        .collect();

    if !temporal.deduplicates() {
        return windowed;
    }
    let mut latest: HashMap<String, StoredRow> = HashMap::new();
    for row in windowed {
        let key = row.identity.storage_key();
        match latest.get(&key) {
            Some(existing) if existing.commit_id >= row.commit_id => {}
            _ => {
                latest.insert(key, row);
            }
        }
    }
    latest.into_values().collect()
}

/// Applies the row predicate and endpoint key restrictions.
pub(crate) fn filter_rows(
    rows: Vec<StoredRow>,
    request: &QueryRequest,
    left_keys: Option<&HashSet<String>>,
    right_keys: Option<&HashSet<String>>,
) -> Vec<StoredRow> {
    rows.into_iter()
        .filter(|row| {
            if let Identity::Relation {
                left_key, right_key, ..
            } = &row.identity
            {
                if let Some(keys) = left_keys {
                    if !keys.contains(left_key) {
                        return false;
                    }
                }
                if let Some(keys) = right_keys {
                    if !keys.contains(right_key) {
                        return false;
                    }
                }
            }
            match &request.filter {
                Some(filter) => eval::matches(filter, &row.view(&request.descriptor)),
                None => true,
            }
        })
        .collect()
}

/// SQL-style value ordering: nulls first, then numbers (booleans as
/// integers), then text.
pub(crate) fn value_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Number(_) | Value::Bool(_) => 1,
            Value::String(_) => 2,
            _ => 3,
        }
    }
    fn as_num(v: &Value) -> Option<f64> {
        match v {
            Value::Number(n) => n.as_f64(),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => match (as_num(a), as_num(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => match (a.as_str(), b.as_str()) {
                (Some(x), Some(y)) => x.cmp(y),
                _ => Ordering::Equal,
            },
        },
        other => other,
    }
}

/// Orders rows (user ordering, then commit order for history modes, then
/// identity) and applies limit/offset.
pub(crate) fn order_and_page(mut rows: Vec<StoredRow>, request: &QueryRequest) -> Vec<StoredRow> {
    let order_by = request.order_by.clone();
    let descriptor = request.descriptor.clone();
    let history = !request.temporal.deduplicates();
    rows.sort_by(|a, b| {
        if let Some((path, dir)) = &order_by {
            let va = resolve_in_view(a, &descriptor, path);
            let vb = resolve_in_view(b, &descriptor, path);
            let cmp = value_cmp(&va, &vb);
            let cmp = match dir {
                SortDir::Asc => cmp,
                SortDir::Desc => cmp.reverse(),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        if history {
            let cmp = a.commit_id.cmp(&b.commit_id);
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        a.identity.storage_key().cmp(&b.identity.storage_key())
    });

    let offset = request.offset.unwrap_or(0) as usize;
    let rows: Vec<StoredRow> = rows.into_iter().skip(offset).collect();
    match request.limit {
        Some(limit) => rows.into_iter().take(limit as usize).collect(),
        None => rows,
    }
}

fn resolve_in_view(row: &StoredRow, descriptor: &TypeDescriptor, path: &FieldPath) -> Value {
    eval::resolve(&row.view(descriptor), path).clone()
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Computes a scalar aggregate with SQL semantics (nulls excluded, empty
/// input yields NULL for everything but COUNT).
pub(crate) fn aggregate_rows(
    rows: &[StoredRow],
    descriptor: &TypeDescriptor,
    call: &AggregateCall,
) -> Result<Value> {
    if call.func == AggFunc::Count {
        return Ok(Value::from(rows.len() as i64));
    }
    let path = call.field.as_ref().ok_or_else(|| {
        EngineError::validation("aggregate requires a target field")
    })?;
    let values: Vec<Value> = rows
        .iter()
        .map(|r| resolve_in_view(r, descriptor, path))
        .collect();

    Ok(match call.func {
        AggFunc::Count => unreachable!(),
        AggFunc::Sum => sum_values(&values),
        AggFunc::Avg => avg_values(&values),
        AggFunc::Min => extremum(&values, Ordering::Less),
        AggFunc::Max => extremum(&values, Ordering::Greater),
        AggFunc::AvgLen => {
            // Null lists are excluded; non-arrays count as length 0,
            // matching json_array_length.
            let lengths: Vec<Value> = values
                .iter()
                .filter(|v| !v.is_null())
                .map(|v| match v {
                    Value::Array(items) => Value::from(items.len() as i64),
                    _ => Value::from(0),
                })
                .collect();
            avg_values(&lengths)
        }
    })
}

fn sum_values(values: &[Value]) -> Value {
    let mut int_sum: i64 = 0;
    let mut float_sum: f64 = 0.0;
    let mut saw_float = false;
    let mut saw_any = false;
    for v in values {
        match v {
            Value::Number(n) => {
                saw_any = true;
                if let Some(i) = n.as_i64() {
                    if saw_float {
                        float_sum += i as f64;
                    } else {
                        int_sum += i;
                    }
                } else if let Some(f) = n.as_f64() {
                    if !saw_float {
                        float_sum = int_sum as f64;
                        saw_float = true;
                    }
                    float_sum += f;
                }
            }
            _ => {}
        }
    }
    if !saw_any {
        Value::Null
    } else if saw_float {
        Value::from(float_sum)
    } else {
        Value::from(int_sum)
    }
}

fn avg_values(values: &[Value]) -> Value {
    let nums: Vec<f64> = values
        .iter()
        .filter_map(|v| v.as_f64())
        .collect();
    if nums.is_empty() {
        Value::Null
    } else {
        Value::from(nums.iter().sum::<f64>() / nums.len() as f64)
    }
}

fn extremum(values: &[Value], keep: Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for v in values.iter().filter(|v| !v.is_null()) {
        best = match best {
            None => Some(v),
            Some(current) => {
                if value_cmp(v, current) == keep {
                    Some(v)
                } else {
                    Some(current)
                }
            }
        };
    }
    best.cloned().unwrap_or(Value::Null)
}

/// Grouped aggregation with `having` applied before materialisation.
pub(crate) fn group_rows(
    rows: &[StoredRow],
    descriptor: &TypeDescriptor,
    group: &GroupByRequest,
) -> Result<Vec<GroupRow>> {
    if group.keys.is_empty() {
        return Err(EngineError::validation("group_by requires at least one key"));
    }
    let mut buckets: BTreeMap<Vec<String>, (Vec<Value>, Vec<&StoredRow>)> = BTreeMap::new();
    for row in rows {
        let key_values: Vec<Value> = group
            .keys
            .iter()
            .map(|k| resolve_in_view(row, descriptor, k))
            .collect();
        let bucket_key: Vec<String> = key_values
            .iter()
            .map(ontic_core::canonical::to_canonical_json)
            .collect();
        buckets
            .entry(bucket_key)
            .or_insert_with(|| (key_values, Vec::new()))
            .1
            .push(row);
    }

    let mut out = Vec::new();
    for (_, (key_values, bucket)) in buckets {
        let owned: Vec<StoredRow> = bucket.into_iter().cloned().collect();
        let mut aggregates = Vec::new();
        for (name, call) in &group.aggregates {
            aggregates.push((name.clone(), aggregate_rows(&owned, descriptor, call)?));
        }
        if let Some(having) = &group.having {
            let value = aggregates
                .iter()
                .find(|(n, _)| n == &having.aggregate)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| {
                    EngineError::validation(format!(
                        "having references unknown aggregate `{}`",
                        having.aggregate
                    ))
                })?;
            // Reuse the shared evaluator so having semantics match WHERE.
            let probe = Filter::Compare(Comparison {
                path: FieldPath::root("x")?,
                op: having.op,
                operand: Operand::Scalar(having.value.clone()),
            });
            if !eval::matches(&probe, &serde_json::json!({ "x": value })) {
                continue;
            }
        }
        let keys = group
            .keys
            .iter()
            .zip(key_values)
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        out.push(GroupRow { keys, aggregates });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontic_core::descriptor::RecordKind;
    use ontic_core::spec::TypeSpec;
    use serde_json::json;

    fn desc() -> TypeDescriptor {
        TypeDescriptor::entity("Customer")
            .primary_key("id")
            .field("name", TypeSpec::str())
            .field("age", TypeSpec::optional(TypeSpec::int()))
            .field("tags", TypeSpec::list(TypeSpec::str()))
            .build()
            .unwrap()
    }

    fn row(key: &str, commit_id: u64, fields: Value) -> StoredRow {
        StoredRow {
            kind: RecordKind::Entity,
            type_name: "Customer".into(),
            identity: Identity::Entity { key: key.into() },
            fields,
            commit_id,
            schema_version_id: 1,
        }
    }

    #[test]
    fn latest_keeps_one_row_per_identity() {
        let rows = vec![
            row("c1", 1, json!({ "age": 1 })),
            row("c1", 3, json!({ "age": 3 })),
            row("c2", 2, json!({ "age": 2 })),
        ];
        let mut latest = apply_temporal(rows, TemporalMode::Latest);
        latest.sort_by_key(|r| r.identity.storage_key());
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].commit_id, 3);
    }

    #[test]
    fn as_of_respects_the_window() {
        let rows = vec![
            row("c1", 1, json!({ "age": 1 })),
            row("c1", 3, json!({ "age": 3 })),
        ];
        let as_of = apply_temporal(rows, TemporalMode::AsOf(2));
        assert_eq!(as_of.len(), 1);
        assert_eq!(as_of[0].commit_id, 1);
    }

    #[test]
    fn history_since_is_exclusive_below() {
        let rows = vec![
            row("c1", 1, json!({})),
            row("c1", 2, json!({})),
            row("c1", 3, json!({})),
        ];
        let since = apply_temporal(rows, TemporalMode::HistorySince(1));
        let commits: Vec<u64> = since.iter().map(|r| r.commit_id).collect();
        assert_eq!(commits, vec![2, 3]);
    }

    #[test]
    fn sum_stays_integer_until_floats_appear() {
        assert_eq!(sum_values(&[json!(1), json!(2)]), json!(3));
        assert_eq!(sum_values(&[json!(1), json!(2.5)]), json!(3.5));
        assert_eq!(sum_values(&[json!(null)]), json!(null));
    }

    #[test]
    fn avg_len_excludes_nulls_and_counts_empty_lists() {
        let rows = vec![
            row("c1", 1, json!({ "tags": ["a", "b"] })),
            row("c2", 1, json!({ "tags": [] })),
            row("c3", 1, json!({ "tags": null })),
        ];
        let call = AggregateCall::over(AggFunc::AvgLen, FieldPath::parse("tags").unwrap());
        let avg = aggregate_rows(&rows, &desc(), &call).unwrap();
        assert_eq!(avg, json!(1.0));
    }

    #[test]
    fn avg_len_over_all_null_lists_is_null() {
        let rows = vec![row("c1", 1, json!({ "tags": null }))];
        let call = AggregateCall::over(AggFunc::AvgLen, FieldPath::parse("tags").unwrap());
        assert_eq!(aggregate_rows(&rows, &desc(), &call).unwrap(), json!(null));
    }

    #[test]
    fn group_rows_with_having() {
        let rows = vec![
            row("c1", 1, json!({ "name": "a", "age": 10 })),
            row("c2", 1, json!({ "name": "a", "age": 20 })),
            row("c3", 1, json!({ "name": "b", "age": 30 })),
        ];
        let group = GroupByRequest {
            keys: vec![FieldPath::parse("name").unwrap()],
            aggregates: vec![("n".into(), AggregateCall::count())],
            having: Some(ontic_core::query::HavingClause {
                aggregate: "n".into(),
                op: ontic_core::filter::CompareOp::Gt,
                value: 1i64.into(),
            }),
        };
        let out = group_rows(&rows, &desc(), &group).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("name"), Some(&json!("a")));
        assert_eq!(out[0].get("n"), Some(&json!(2)));
    }
}
