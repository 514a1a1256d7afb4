//! Backend-neutral query requests.
//!
//! The typed DSL in `ontic-query` compiles down to these shapes; both
//! storage backends execute them.

use serde::{Deserialize, Serialize};

use crate::descriptor::{RecordKind, TypeDescriptor};
use crate::filter::{CompareOp, FieldPath, Filter, Scalar};

/// Which slice of history a query reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemporalMode {
    /// Current state: window `[1, head]`, one row per identity (latest).
    Latest,
    /// State as of a commit: window `[1, min(c, head)]`, deduplicated.
    AsOf(u64),
    /// Full history: every row, ordered `commit_id ASC` with identity
    /// tie-break.
    WithHistory,
    /// History strictly after a commit: window `(c, head]`, no dedup.
    HistorySince(u64),
}

impl TemporalMode {
    /// Whether this mode keeps only the latest row per identity.
    pub fn deduplicates(&self) -> bool {
        matches!(self, TemporalMode::Latest | TemporalMode::AsOf(_))
    }
}

/// Sort direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDir {
    Asc,
    Desc,
}

/// Which side of a relation an endpoint predicate targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointSide {
    Left,
    Right,
}

/// A predicate over a relation's endpoint entity, compiled to an EXISTS
/// subquery with the outer temporal mode.
#[derive(Clone, Debug)]
pub struct EndpointFilter {
    pub side: EndpointSide,
    pub filter: Filter,
}

/// A compiled row query against one type.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub kind: RecordKind,
    pub type_name: String,
    /// Descriptor of the queried type (identity columns, field specs).
    pub descriptor: TypeDescriptor,
    /// Current schema version typed reads are scoped to.
    pub schema_version: i64,
    pub temporal: TemporalMode,
    pub filter: Option<Filter>,
    /// Endpoint predicates (relation queries only) with the endpoint
    /// descriptors needed to compile them.
    pub endpoint_filters: Vec<EndpointFilter>,
    pub left_descriptor: Option<TypeDescriptor>,
    pub right_descriptor: Option<TypeDescriptor>,
    /// Current schema versions of the endpoint types, when endpoint
    /// predicates are present.
    pub left_schema_version: Option<i64>,
    pub right_schema_version: Option<i64>,
    pub order_by: Option<(FieldPath, SortDir)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryRequest {
    /// A bare latest-state query for a type.
    pub fn latest(descriptor: TypeDescriptor) -> Self {
        Self {
            kind: descriptor.kind,
            type_name: descriptor.name.clone(),
            descriptor,
            schema_version: 1,
            temporal: TemporalMode::Latest,
            filter: None,
            endpoint_filters: Vec::new(),
            left_descriptor: None,
            right_descriptor: None,
            left_schema_version: None,
            right_schema_version: None,
            order_by: None,
            limit: None,
            offset: None,
        }
    }
}

/// Scalar aggregate functions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    /// Average `json_array_length` of a list field; null lists excluded,
    /// empty lists contribute 0.
    AvgLen,
}

/// One aggregate computation.
#[derive(Clone, Debug)]
pub struct AggregateCall {
    pub func: AggFunc,
    /// Target field; `None` only for `Count`.
    pub field: Option<FieldPath>,
}

impl AggregateCall {
    pub fn count() -> Self {
        Self {
            func: AggFunc::Count,
            field: None,
        }
    }

    pub fn over(func: AggFunc, field: FieldPath) -> Self {
        Self {
            func,
            field: Some(field),
        }
    }
}

/// A `having` clause over a named aggregate of the grouped query.
#[derive(Clone, Debug)]
pub struct HavingClause {
    /// Name of the aggregate (as passed to `agg`).
    pub aggregate: String,
    pub op: CompareOp,
    pub value: Scalar,
}

/// A grouped aggregation request layered over a row query.
#[derive(Clone, Debug)]
pub struct GroupByRequest {
    pub keys: Vec<FieldPath>,
    /// `(output name, aggregate)` pairs.
    pub aggregates: Vec<(String, AggregateCall)>,
    pub having: Option<HavingClause>,
}

/// One output row of a grouped aggregation: group key values followed by
/// named aggregate values, both in declaration order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupRow {
    pub keys: Vec<(String, serde_json::Value)>,
    pub aggregates: Vec<(String, serde_json::Value)>,
}

impl GroupRow {
    /// Looks up a group key or aggregate value by name.
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.keys
            .iter()
            .chain(self.aggregates.iter())
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}
