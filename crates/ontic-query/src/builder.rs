//! Typed query builders.

use std::marker::PhantomData;

use serde_json::Value;

use ontic_core::descriptor::TypeDescriptor;
use ontic_core::error::{EngineError, Result};
use ontic_core::filter::{CompareOp, Filter, Scalar};
use ontic_core::intent::{EntityType, RelationType};
use ontic_core::query::{
    AggFunc, AggregateCall, EndpointFilter, EndpointSide, GroupByRequest, GroupRow, HavingClause,
    QueryRequest, SortDir, TemporalMode,
};
use ontic_core::row::StoredRow;
use ontic_core::spec::PathResolution;
use ontic_storage::Repository;

use crate::proxy::FieldProxy;
use crate::Query;

/// Shared builder state for entity and relation queries.
pub(crate) struct BuilderCore<'a> {
    pub(crate) repo: &'a dyn Repository,
    pub(crate) request: QueryRequest,
    /// First deferred build error; surfaced by the terminal.
    pub(crate) error: Option<EngineError>,
}

impl<'a> BuilderCore<'a> {
    fn fail(&mut self, error: EngineError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Build-time validation: operator rules plus descriptor-aware type
    /// checks (declared fields, `any_path` only on list fields).
    fn check_filter(filter: &Filter, descriptor: &TypeDescriptor) -> Result<()> {
        filter.validate()?;
        check_filter_fields(filter, descriptor)
    }

    fn add_filter(&mut self, filter: Filter) {
        if let Err(e) = Self::check_filter(&filter, &self.request.descriptor) {
            self.fail(e);
            return;
        }
        self.request.filter = Some(match self.request.filter.take() {
            Some(existing) => existing & filter,
            None => filter,
        });
    }

    fn order_by(&mut self, proxy: &FieldProxy, dir: SortDir) {
        match &proxy.path {
            Ok(path) => self.request.order_by = Some((path.clone(), dir)),
            Err(message) => self.fail(EngineError::validation(message.clone())),
        }
    }

    fn rows(&self) -> Result<Vec<StoredRow>> {
        if let Some(error) = &self.error {
            return Err(EngineError::validation(error.to_string()));
        }
        self.repo.query_rows(&self.request)
    }

    fn aggregate(&self, call: AggregateCall) -> Result<Value> {
        if let Some(error) = &self.error {
            return Err(EngineError::validation(error.to_string()));
        }
        self.repo.aggregate(&self.request, &call)
    }

    fn field_call(&mut self, func: AggFunc, proxy: &FieldProxy) -> Option<AggregateCall> {
        match &proxy.path {
            Ok(path) => Some(AggregateCall {
                func,
                field: Some(path.clone()),
            }),
            Err(message) => {
                self.fail(EngineError::validation(message.clone()));
                None
            }
        }
    }
}

fn check_filter_fields(filter: &Filter, descriptor: &TypeDescriptor) -> Result<()> {
    match filter {
        Filter::Compare(c) => {
            let head = c.path.head();
            if descriptor.field(head).is_none() {
                return Err(EngineError::validation(format!(
                    "unknown field `{head}` on type {}",
                    descriptor.name
                )));
            }
            Ok(())
        }
        Filter::Exists(e) => {
            let head = e.list_path.head();
            let Some(field) = descriptor.field(head) else {
                return Err(EngineError::validation(format!(
                    "unknown field `{head}` on type {}",
                    descriptor.name
                )));
            };
            // Resolve the terminal spec through the whole path; the
            // list requirement applies at any depth. Only statically
            // unanswerable shapes (mixed unions, back-edges) pass
            // through to runtime evaluation.
            match field.spec.resolve_path(&e.list_path.segments()[1..]) {
                PathResolution::Resolved(spec) if spec.is_list() => Ok(()),
                PathResolution::Unknown => Ok(()),
                PathResolution::Resolved(_) | PathResolution::Never => {
                    Err(EngineError::validation(format!(
                        "any_path requires a list-typed field; `{}` on {} is not a list",
                        e.list_path, descriptor.name
                    )))
                }
            }
        }
        Filter::And(a, b) | Filter::Or(a, b) => {
            check_filter_fields(a, descriptor)?;
            check_filter_fields(b, descriptor)
        }
        Filter::Not(inner) => check_filter_fields(inner, descriptor),
        Filter::Invalid(message) => Err(EngineError::validation(message.clone())),
    }
}

// ---------------------------------------------------------------------------
// Entity queries
// ---------------------------------------------------------------------------

/// Fluent query over one entity type.
pub struct EntityQuery<'a, T: EntityType> {
    pub(crate) core: BuilderCore<'a>,
    _marker: PhantomData<T>,
}

impl<'a, T: EntityType> EntityQuery<'a, T> {
    pub(crate) fn new(query: &Query<'a>) -> Result<Self> {
        let descriptor = T::descriptor();
        let version = query.version_of(T::NAME)?;
        let mut request = QueryRequest::latest(descriptor);
        request.schema_version = version;
        Ok(Self {
            core: BuilderCore {
                repo: query.repo(),
                request,
                error: None,
            },
            _marker: PhantomData,
        })
    }

    /// Adds a predicate; multiple calls AND together.
    pub fn where_(mut self, filter: Filter) -> Self {
        self.core.add_filter(filter);
        self
    }

    pub fn order_by(mut self, proxy: &FieldProxy) -> Self {
        self.core.order_by(proxy, SortDir::Asc);
        self
    }

    pub fn order_by_desc(mut self, proxy: &FieldProxy) -> Self {
        self.core.order_by(proxy, SortDir::Desc);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.core.request.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.core.request.offset = Some(offset);
        self
    }

    // -- Temporal modes ------------------------------------------------------

    pub fn as_of(mut self, commit_id: u64) -> Self {
        self.core.request.temporal = TemporalMode::AsOf(commit_id);
        self
    }

    pub fn with_history(mut self) -> Self {
        self.core.request.temporal = TemporalMode::WithHistory;
        self
    }

    pub fn history_since(mut self, commit_id: u64) -> Self {
        self.core.request.temporal = TemporalMode::HistorySince(commit_id);
        self
    }

    // -- Terminals -----------------------------------------------------------

    /// Raw stored rows (history queries, tooling).
    pub fn rows(self) -> Result<Vec<StoredRow>> {
        self.core.rows()
    }

    /// Typed results.
    pub fn collect(self) -> Result<Vec<T>> {
        let descriptor = self.core.request.descriptor.clone();
        self.core
            .rows()?
            .iter()
            .map(|row| row.decode::<T>(&descriptor))
            .collect()
    }

    /// First result, if any.
    pub fn first(mut self) -> Result<Option<T>> {
        self.core.request.limit = Some(1);
        Ok(self.collect()?.into_iter().next())
    }

    pub fn count(self) -> Result<u64> {
        let value = self.core.aggregate(AggregateCall::count())?;
        Ok(value.as_u64().unwrap_or(0))
    }

    /// `where_(filter).count()` in one step.
    pub fn count_where(self, filter: Filter) -> Result<u64> {
        self.where_(filter).count()
    }

    pub fn sum(mut self, proxy: &FieldProxy) -> Result<Value> {
        match self.core.field_call(AggFunc::Sum, proxy) {
            Some(call) => self.core.aggregate(call),
            None => self.core.rows().map(|_| Value::Null),
        }
    }

    pub fn avg(mut self, proxy: &FieldProxy) -> Result<Value> {
        match self.core.field_call(AggFunc::Avg, proxy) {
            Some(call) => self.core.aggregate(call),
            None => self.core.rows().map(|_| Value::Null),
        }
    }

    pub fn min(mut self, proxy: &FieldProxy) -> Result<Value> {
        match self.core.field_call(AggFunc::Min, proxy) {
            Some(call) => self.core.aggregate(call),
            None => self.core.rows().map(|_| Value::Null),
        }
    }

    pub fn max(mut self, proxy: &FieldProxy) -> Result<Value> {
        match self.core.field_call(AggFunc::Max, proxy) {
            Some(call) => self.core.aggregate(call),
            None => self.core.rows().map(|_| Value::Null),
        }
    }

    /// Average length of a list field over matching rows.
    pub fn avg_len(mut self, proxy: &FieldProxy) -> Result<Value> {
        match self.core.field_call(AggFunc::AvgLen, proxy) {
            Some(call) => self.core.aggregate(call),
            None => self.core.rows().map(|_| Value::Null),
        }
    }

    /// Starts a grouped aggregation over the current filter and mode.
    pub fn group_by(mut self, keys: &[&FieldProxy]) -> GroupedQuery<'a> {
        let mut parsed = Vec::new();
        for proxy in keys {
            match &proxy.path {
                Ok(path) => parsed.push(path.clone()),
                Err(message) => self.core.fail(EngineError::validation(message.clone())),
            }
        }
        GroupedQuery {
            core: self.core,
            group: GroupByRequest {
                keys: parsed,
                aggregates: Vec::new(),
                having: None,
            },
        }
    }

    /// Traverses a relation whose left endpoint is this entity type.
    pub fn via<R>(self) -> Result<crate::traversal::Traversal<'a, T, R>>
    where
        R: RelationType<Left = T>,
    {
        crate::traversal::Traversal::new(self)
    }
}

// ---------------------------------------------------------------------------
// Relation queries
// ---------------------------------------------------------------------------

/// Fluent query over one relation type.
pub struct RelationQuery<'a, R: RelationType> {
    pub(crate) core: BuilderCore<'a>,
    _marker: PhantomData<R>,
}

impl<'a, R: RelationType> RelationQuery<'a, R> {
    pub(crate) fn new(query: &Query<'a>) -> Result<Self> {
        let descriptor = R::descriptor();
        let version = query.version_of(R::NAME)?;
        let mut request = QueryRequest::latest(descriptor);
        request.schema_version = version;
        request.left_descriptor = Some(R::Left::descriptor());
        request.right_descriptor = Some(R::Right::descriptor());
        request.left_schema_version = query.version_of(R::Left::NAME).ok();
        request.right_schema_version = query.version_of(R::Right::NAME).ok();
        Ok(Self {
            core: BuilderCore {
                repo: query.repo(),
                request,
                error: None,
            },
            _marker: PhantomData,
        })
    }

    /// Adds a predicate over the relation's own fields.
    pub fn where_(mut self, filter: Filter) -> Self {
        self.core.add_filter(filter);
        self
    }

    /// Adds a predicate over the left endpoint entity's fields.
    pub fn where_left(mut self, filter: Filter) -> Self {
        self.add_endpoint(EndpointSide::Left, filter);
        self
    }

    /// Adds a predicate over the right endpoint entity's fields.
    pub fn where_right(mut self, filter: Filter) -> Self {
        self.add_endpoint(EndpointSide::Right, filter);
        self
    }

    fn add_endpoint(&mut self, side: EndpointSide, filter: Filter) {
        let descriptor = match side {
            EndpointSide::Left => self.core.request.left_descriptor.clone(),
            EndpointSide::Right => self.core.request.right_descriptor.clone(),
        };
        let Some(descriptor) = descriptor else {
            self.core.fail(EngineError::validation(
                "endpoint predicate without endpoint descriptor",
            ));
            return;
        };
        if let Err(e) = BuilderCore::check_filter(&filter, &descriptor) {
            self.core.fail(e);
            return;
        }
        // Existential predicates are not supported through endpoints.
        if contains_exists(&filter) {
            self.core.fail(EngineError::validation(
                "any_path is not available on endpoint predicates",
            ));
            return;
        }
        self.core
            .request
            .endpoint_filters
            .push(EndpointFilter { side, filter });
    }

    pub fn order_by(mut self, proxy: &FieldProxy) -> Self {
        self.core.order_by(proxy, SortDir::Asc);
        self
    }

    pub fn order_by_desc(mut self, proxy: &FieldProxy) -> Self {
        self.core.order_by(proxy, SortDir::Desc);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.core.request.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.core.request.offset = Some(offset);
        self
    }

    pub fn as_of(mut self, commit_id: u64) -> Self {
        self.core.request.temporal = TemporalMode::AsOf(commit_id);
        self
    }

    pub fn with_history(mut self) -> Self {
        self.core.request.temporal = TemporalMode::WithHistory;
        self
    }

    pub fn history_since(mut self, commit_id: u64) -> Self {
        self.core.request.temporal = TemporalMode::HistorySince(commit_id);
        self
    }

    pub fn rows(self) -> Result<Vec<StoredRow>> {
        self.core.rows()
    }

    pub fn collect(self) -> Result<Vec<R>> {
        let descriptor = self.core.request.descriptor.clone();
        self.core
            .rows()?
            .iter()
            .map(|row| row.decode::<R>(&descriptor))
            .collect()
    }

    pub fn first(mut self) -> Result<Option<R>> {
        self.core.request.limit = Some(1);
        Ok(self.collect()?.into_iter().next())
    }

    pub fn count(self) -> Result<u64> {
        let value = self.core.aggregate(AggregateCall::count())?;
        Ok(value.as_u64().unwrap_or(0))
    }

    pub fn count_where(self, filter: Filter) -> Result<u64> {
        self.where_(filter).count()
    }

    pub fn sum(mut self, proxy: &FieldProxy) -> Result<Value> {
        match self.core.field_call(AggFunc::Sum, proxy) {
            Some(call) => self.core.aggregate(call),
            None => self.core.rows().map(|_| Value::Null),
        }
    }

    pub fn avg(mut self, proxy: &FieldProxy) -> Result<Value> {
        match self.core.field_call(AggFunc::Avg, proxy) {
            Some(call) => self.core.aggregate(call),
            None => self.core.rows().map(|_| Value::Null),
        }
    }

    pub fn group_by(mut self, keys: &[&FieldProxy]) -> GroupedQuery<'a> {
        let mut parsed = Vec::new();
        for proxy in keys {
            match &proxy.path {
                Ok(path) => parsed.push(path.clone()),
                Err(message) => self.core.fail(EngineError::validation(message.clone())),
            }
        }
        GroupedQuery {
            core: self.core,
            group: GroupByRequest {
                keys: parsed,
                aggregates: Vec::new(),
                having: None,
            },
        }
    }
}

fn contains_exists(filter: &Filter) -> bool {
    match filter {
        Filter::Exists(_) => true,
        Filter::And(a, b) | Filter::Or(a, b) => contains_exists(a) || contains_exists(b),
        Filter::Not(inner) => contains_exists(inner),
        Filter::Compare(_) | Filter::Invalid(_) => false,
    }
}

// ---------------------------------------------------------------------------
// Grouped aggregation
// ---------------------------------------------------------------------------

/// A grouped aggregation terminal.
pub struct GroupedQuery<'a> {
    core: BuilderCore<'a>,
    group: GroupByRequest,
}

impl GroupedQuery<'_> {
    /// Adds a named aggregate to the output.
    pub fn agg(mut self, name: &str, call: AggregateCall) -> Self {
        self.group.aggregates.push((name.to_string(), call));
        self
    }

    /// Filters groups on a named aggregate before materialisation.
    pub fn having(mut self, aggregate: &str, op: CompareOp, value: impl Into<Scalar>) -> Self {
        self.group.having = Some(HavingClause {
            aggregate: aggregate.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    /// Materialises the grouped rows.
    pub fn collect(self) -> Result<Vec<GroupRow>> {
        if let Some(error) = &self.core.error {
            return Err(EngineError::validation(error.to_string()));
        }
        self.core.repo.group_aggregate(&self.core.request, &self.group)
    }
}
