//! Cron-driven event schedules.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use ontic_core::event::EventDraft;

use crate::cron::CronExpr;

/// A schedule emits a fresh copy of its event template as a root event
/// each time the cron expression matches a new minute.
///
/// Multi-session coordination is deliberately left to the claim
/// primitive: every session whose loop observes a matching minute
/// enqueues an event, and consumers race for the claims. Operators who
/// need single-fire semantics across sessions serialise schedule
/// emission at the application layer.
pub struct Schedule {
    pub(crate) template: EventDraft,
    pub(crate) cron: CronExpr,
    /// Last minute this session fired for, to fire at most once per
    /// matching minute.
    pub(crate) last_fired: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn new(template: EventDraft, cron: CronExpr) -> Self {
        Self {
            template,
            cron,
            last_fired: None,
        }
    }

    /// Returns the template to emit when the schedule is due at `now`.
    pub(crate) fn due(&mut self, now: DateTime<Utc>) -> Option<EventDraft> {
        let minute = now
            .duration_trunc(TimeDelta::minutes(1))
            .unwrap_or(now);
        if self.last_fired == Some(minute) || !self.cron.matches(minute) {
            return None;
        }
        self.last_fired = Some(minute);
        Some(self.template.clone())
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule")
            .field("event_type", &self.template.event_type)
            .field("cron", &self.cron.source())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn fires_once_per_matching_minute() {
        let mut schedule = Schedule::new(
            EventDraft::raw("report.tick", json!({})),
            CronExpr::parse("* * * * *").unwrap(),
        );
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 9, 30, 5).unwrap();
        assert!(schedule.due(now).is_some());
        // Same minute, later second: no second fire.
        let later = Utc.with_ymd_and_hms(2024, 6, 15, 9, 30, 50).unwrap();
        assert!(schedule.due(later).is_none());
        // Next minute fires again.
        let next = Utc.with_ymd_and_hms(2024, 6, 15, 9, 31, 0).unwrap();
        assert!(schedule.due(next).is_some());
    }

    #[test]
    fn non_matching_minute_stays_quiet() {
        let mut schedule = Schedule::new(
            EventDraft::raw("report.tick", json!({})),
            CronExpr::parse("0 12 * * *").unwrap(),
        );
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 9, 30, 0).unwrap();
        assert!(schedule.due(now).is_none());
    }
}
