//! Five-field cron expressions.
//!
//! Supports the standard syntax per field: `*`, single values, ranges
//! (`a-b`), lists (`a,b,c`) and steps (`*/n`, `a-b/n`). Day-of-month and
//! day-of-week combine with OR when both are restricted, matching the
//! traditional crontab behaviour.

use chrono::{DateTime, Datelike, Timelike, Utc};

use ontic_core::error::{EngineError, Result};

/// A parsed cron expression.
#[derive(Clone, Debug, PartialEq)]
pub struct CronExpr {
    minutes: Vec<bool>,
    hours: Vec<bool>,
    days_of_month: Vec<bool>,
    months: Vec<bool>,
    days_of_week: Vec<bool>,
    dom_restricted: bool,
    dow_restricted: bool,
    source: String,
}

impl CronExpr {
    /// Parses a 5-field cron expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(EngineError::validation(format!(
                "cron expression `{expr}` must have 5 fields, found {}",
                fields.len()
            )));
        }
        let minutes = parse_field(fields[0], 0, 59)?;
        let hours = parse_field(fields[1], 0, 23)?;
        let days_of_month = parse_field(fields[2], 1, 31)?;
        let months = parse_field(fields[3], 1, 12)?;
        let days_of_week = parse_field(fields[4], 0, 7)?;

        Ok(Self {
            minutes,
            hours,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
            days_of_month,
            months,
            days_of_week,
            source: expr.to_string(),
        })
    }

    /// Whether the expression matches the given instant (minute
    /// granularity).
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if !self.minutes[at.minute() as usize] {
            return false;
        }
        if !self.hours[at.hour() as usize] {
            return false;
        }
        if !self.months[at.month() as usize - 1] {
            return false;
        }
        let dom = self.days_of_month[at.day() as usize - 1];
        // Sunday is both 0 and 7.
        let weekday = at.weekday().num_days_from_sunday() as usize;
        let dow = self.days_of_week[weekday] || (weekday == 0 && self.days_of_week[7]);

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Parses one cron field into a membership table indexed from `min`.
fn parse_field(field: &str, min: u32, max: u32) -> Result<Vec<bool>> {
    let size = (max - min + 1) as usize;
    let mut table = vec![false; size];

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    EngineError::validation(format!("bad cron step in `{part}`"))
                })?;
                if step == 0 {
                    return Err(EngineError::validation(format!(
                        "cron step must be positive in `{part}`"
                    )));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a
                .parse()
                .map_err(|_| EngineError::validation(format!("bad cron range in `{part}`")))?;
            let b: u32 = b
                .parse()
                .map_err(|_| EngineError::validation(format!("bad cron range in `{part}`")))?;
            (a, b)
        } else {
            let v: u32 = range
                .parse()
                .map_err(|_| EngineError::validation(format!("bad cron value `{part}`")))?;
            (v, v)
        };

        if start < min || end > max || start > end {
            return Err(EngineError::validation(format!(
                "cron value out of range in `{part}` (allowed {min}-{max})"
            )));
        }
        let mut v = start;
        while v <= end {
            table[(v - min) as usize] = true;
            v += step;
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn wildcard_matches_every_minute() {
        let cron = CronExpr::parse("* * * * *").unwrap();
        assert!(cron.matches(at(2024, 6, 15, 12, 34)));
    }

    #[test]
    fn fixed_minute_and_hour() {
        let cron = CronExpr::parse("30 9 * * *").unwrap();
        assert!(cron.matches(at(2024, 6, 15, 9, 30)));
        assert!(!cron.matches(at(2024, 6, 15, 9, 31)));
        assert!(!cron.matches(at(2024, 6, 15, 10, 30)));
    }

    #[test]
    fn steps_and_ranges() {
        let cron = CronExpr::parse("*/15 8-17 * * *").unwrap();
        assert!(cron.matches(at(2024, 6, 15, 8, 0)));
        assert!(cron.matches(at(2024, 6, 15, 17, 45)));
        assert!(!cron.matches(at(2024, 6, 15, 7, 45)));
        assert!(!cron.matches(at(2024, 6, 15, 9, 10)));
    }

    #[test]
    fn lists() {
        let cron = CronExpr::parse("0 0 1,15 * *").unwrap();
        assert!(cron.matches(at(2024, 6, 1, 0, 0)));
        assert!(cron.matches(at(2024, 6, 15, 0, 0)));
        assert!(!cron.matches(at(2024, 6, 2, 0, 0)));
    }

    #[test]
    fn weekday_with_sunday_as_seven() {
        // 2024-06-16 is a Sunday.
        let cron = CronExpr::parse("0 0 * * 7").unwrap();
        assert!(cron.matches(at(2024, 6, 16, 0, 0)));
        let cron = CronExpr::parse("0 0 * * 0").unwrap();
        assert!(cron.matches(at(2024, 6, 16, 0, 0)));
    }

    #[test]
    fn dom_and_dow_combine_with_or() {
        // 2024-06-17 is a Monday, not the 1st.
        let cron = CronExpr::parse("0 0 1 * 1").unwrap();
        assert!(cron.matches(at(2024, 6, 17, 0, 0)));
        assert!(cron.matches(at(2024, 6, 1, 0, 0)));
        assert!(!cron.matches(at(2024, 6, 18, 0, 0)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("61 * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("a * * * *").is_err());
        assert!(CronExpr::parse("5-2 * * * *").is_err());
    }
}
