//! Transactional SQLite backend.

mod compile;
pub(crate) mod events;
pub(crate) mod layout;
mod queries;
mod schema;
mod store;

pub use store::SqliteRepository;

use chrono::{DateTime, Utc};

use ontic_core::error::{EngineError, Result};

/// Formats a timestamp for storage: ISO 8601 with millisecond precision,
/// lexicographically sortable.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parses a stored timestamp.
pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::storage(format!("bad stored timestamp `{raw}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_round_trip_preserves_millis() {
        let now = Utc::now();
        let parsed = parse_ts(&fmt_ts(&now)).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let early = parse_ts("2024-01-01T00:00:00.000Z").unwrap();
        let late = parse_ts("2024-01-01T00:00:00.001Z").unwrap();
        assert!(fmt_ts(&early) < fmt_ts(&late));
    }
}
