//! Aggregate builders for grouped queries.

use ontic_core::query::{AggFunc, AggregateCall};

use crate::proxy::FieldProxy;

fn over(func: AggFunc, proxy: &FieldProxy) -> AggregateCall {
    match &proxy.path {
        Ok(path) => AggregateCall {
            func,
            field: Some(path.clone()),
        },
        // A bad path surfaces as "aggregate requires a target field"
        // when the request executes; the builder validates earlier.
        Err(_) => AggregateCall { func, field: None },
    }
}

/// `COUNT(*)` over the group.
pub fn count() -> AggregateCall {
    AggregateCall::count()
}

/// `SUM(field)` over the group.
pub fn sum(proxy: &FieldProxy) -> AggregateCall {
    over(AggFunc::Sum, proxy)
}

/// `AVG(field)` over the group.
pub fn avg(proxy: &FieldProxy) -> AggregateCall {
    over(AggFunc::Avg, proxy)
}

/// `MIN(field)` over the group.
pub fn min_of(proxy: &FieldProxy) -> AggregateCall {
    over(AggFunc::Min, proxy)
}

/// `MAX(field)` over the group.
pub fn max_of(proxy: &FieldProxy) -> AggregateCall {
    over(AggFunc::Max, proxy)
}

/// Average list length of a list field.
pub fn avg_len(proxy: &FieldProxy) -> AggregateCall {
    over(AggFunc::AvgLen, proxy)
}
