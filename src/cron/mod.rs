//! Five-field cron expressions and the per-process restart timer.
//!
//! Expressions use the classic `minute hour day-of-month month day-of-week`
//! layout. Fire times have minute resolution and are always strictly after
//! the instant they are computed from.
//!
//! The parser is local rather than the `cron` crate: that crate expects six
//! or seven fields, numbers Sunday as 1 and has no vixie day-of-month OR
//! day-of-week rule.

pub mod scheduler;

pub use scheduler::{CronScheduler, CronTrigger};

use crate::error::{Result, WardenError};
use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use std::fmt;
use std::str::FromStr;

/// How far ahead `next_after` searches before concluding a schedule is dead
const SEARCH_HORIZON_YEARS: i32 = 10;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Longest possible length of each month, February counted as leap
const MAX_MONTH_DAYS: [u32; 12] = [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

struct FieldKind {
    label: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of `names[0]`
    name_base: u32,
}

const MINUTE: FieldKind = FieldKind {
    label: "minute",
    min: 0,
    max: 59,
    names: &[],
    name_base: 0,
};
const HOUR: FieldKind = FieldKind {
    label: "hour",
    min: 0,
    max: 23,
    names: &[],
    name_base: 0,
};
const DAY_OF_MONTH: FieldKind = FieldKind {
    label: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    name_base: 0,
};
const MONTH: FieldKind = FieldKind {
    label: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    name_base: 1,
};
const DAY_OF_WEEK: FieldKind = FieldKind {
    label: "day-of-week",
    min: 0,
    max: 6,
    names: DAY_NAMES,
    name_base: 0,
};

/// A parsed cron expression
///
/// Each field is stored as a bitmask where bit `n` set means value `n`
/// matches.
#[derive(Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a 5-field expression or one of the `@hourly`-style macros
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let expanded = expand_macro(trimmed).unwrap_or(trimmed);

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(WardenError::invalid_cron(
                expr,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let schedule = Self {
            source: trimmed.to_string(),
            minutes: parse_field(expr, fields[0], &MINUTE)?,
            hours: parse_field(expr, fields[1], &HOUR)?,
            days_of_month: parse_field(expr, fields[2], &DAY_OF_MONTH)?,
            months: parse_field(expr, fields[3], &MONTH)?,
            days_of_week: parse_field(expr, fields[4], &DAY_OF_WEEK)?,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        };

        if !schedule.can_fire() {
            return Err(WardenError::invalid_cron(
                expr,
                "day-of-month never occurs in the selected months",
            ));
        }

        Ok(schedule)
    }

    /// The expression this schedule was parsed from
    pub fn expression(&self) -> &str {
        &self.source
    }

    /// Next fire time strictly after `from`, in the same time zone
    ///
    /// Local times that do not exist (DST gaps) are skipped; ambiguous
    /// local times resolve to the earliest instant still after `from`.
    pub fn next_after<Tz: TimeZone>(&self, from: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = from.timezone();
        let mut candidate = self.next_naive_after(from.naive_local())?;

        loop {
            match tz.from_local_datetime(&candidate) {
                LocalResult::Single(dt) if dt > *from => return Some(dt),
                LocalResult::Ambiguous(early, late) => {
                    if early > *from {
                        return Some(early);
                    }
                    if late > *from {
                        return Some(late);
                    }
                }
                _ => {}
            }
            candidate = self.next_naive_after(candidate)?;
        }
    }

    /// Lazy, infinite sequence of fire times after `from`
    pub fn ticker<Tz: TimeZone>(&self, from: DateTime<Tz>) -> Ticker<Tz> {
        Ticker {
            schedule: self.clone(),
            cursor: from,
        }
    }

    fn next_naive_after(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let floor = after.date().and_hms_opt(after.hour(), after.minute(), 0)?;
        let mut t = floor.checked_add_signed(Duration::minutes(1))?;
        let horizon = t.year() + SEARCH_HORIZON_YEARS;

        while t.year() <= horizon {
            if !bit(self.months, t.month()) {
                let (y, m) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(y, m, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            if !bit(self.hours, t.hour()) {
                t = if t.hour() == 23 {
                    t.date().succ_opt()?.and_hms_opt(0, 0, 0)?
                } else {
                    t.date().and_hms_opt(t.hour() + 1, 0, 0)?
                };
                continue;
            }

            match (t.minute()..60).find(|m| bit(self.minutes, *m)) {
                Some(minute) => return t.date().and_hms_opt(t.hour(), minute, 0),
                None => {
                    t = t.date().and_hms_opt(t.hour(), 59, 0)?.checked_add_signed(Duration::minutes(1))?;
                }
            }
        }

        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());

        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    fn can_fire(&self) -> bool {
        if !self.dom_restricted || self.dow_restricted {
            return true;
        }
        (1..=12u32).any(|month| {
            bit(self.months, month)
                && (1..=MAX_MONTH_DAYS[(month - 1) as usize]).any(|day| bit(self.days_of_month, day))
        })
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.source).finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronSchedule {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Infinite iterator over the fire times of a schedule
#[derive(Debug, Clone)]
pub struct Ticker<Tz: TimeZone> {
    schedule: CronSchedule,
    cursor: DateTime<Tz>,
}

impl<Tz: TimeZone> Iterator for Ticker<Tz> {
    type Item = DateTime<Tz>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.schedule.next_after(&self.cursor)?;
        self.cursor = next.clone();
        Some(next)
    }
}

/// Compute the first fire time of `expr` strictly after `from`
pub fn next_fire_after<Tz: TimeZone>(expr: &str, from: &DateTime<Tz>) -> Result<DateTime<Tz>> {
    let schedule = CronSchedule::parse(expr)?;
    schedule
        .next_after(from)
        .ok_or_else(|| WardenError::invalid_cron(expr, "no upcoming fire time"))
}

fn expand_macro(expr: &str) -> Option<&'static str> {
    match expr.to_ascii_lowercase().as_str() {
        "@hourly" => Some("0 * * * *"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@monthly" => Some("0 0 1 * *"),
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        _ => None,
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn parse_field(expr: &str, field: &str, kind: &FieldKind) -> Result<u64> {
    let mut mask = 0u64;

    for part in field.split(',') {
        if part.is_empty() {
            return Err(WardenError::invalid_cron(
                expr,
                format!("empty list entry in {} field", kind.label),
            ));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    WardenError::invalid_cron(
                        expr,
                        format!("invalid step '{}' in {} field", step, kind.label),
                    )
                })?;
                if step == 0 {
                    return Err(WardenError::invalid_cron(
                        expr,
                        format!("step must be positive in {} field", kind.label),
                    ));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range == "*" {
            (kind.min, kind.max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_value(expr, lo, kind)?, parse_value(expr, hi, kind)?)
        } else {
            let value = parse_value(expr, range, kind)?;
            // `5/15` means "from 5 to the end, every 15"
            if step.is_some() {
                (value, kind.max)
            } else {
                (value, value)
            }
        };

        if start > end {
            return Err(WardenError::invalid_cron(
                expr,
                format!("range {}-{} is reversed in {} field", start, end, kind.label),
            ));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (start..=end).step_by(step) {
            mask |= 1u64 << value;
        }
    }

    Ok(mask)
}

fn parse_value(expr: &str, raw: &str, kind: &FieldKind) -> Result<u32> {
    let value = match raw.parse::<u32>() {
        Ok(value) => value,
        Err(_) => kind
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(raw))
            .map(|idx| idx as u32 + kind.name_base)
            .ok_or_else(|| {
                WardenError::invalid_cron(
                    expr,
                    format!("invalid value '{}' in {} field", raw, kind.label),
                )
            })?,
    };

    if value < kind.min || value > kind.max {
        return Err(WardenError::invalid_cron(
            expr,
            format!(
                "{} out of range for {} field ({}-{})",
                value, kind.label, kind.min, kind.max
            ),
        ));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_hourly_fires_on_the_hour() {
        let next = next_fire_after("0 * * * *", &at(2024, 5, 10, 12, 17, 0)).unwrap();
        assert_eq!(next, at(2024, 5, 10, 13, 0, 0));

        let again = next_fire_after("0 * * * *", &next).unwrap();
        assert_eq!(again, at(2024, 5, 10, 14, 0, 0));
    }

    #[test]
    fn test_strictly_after_exact_match() {
        let from = at(2024, 5, 10, 12, 30, 0);
        let next = next_fire_after("30 12 * * *", &from).unwrap();
        assert_eq!(next, at(2024, 5, 11, 12, 30, 0));
    }

    #[test]
    fn test_seconds_are_truncated() {
        let next = next_fire_after("* * * * *", &at(2024, 5, 10, 12, 30, 45)).unwrap();
        assert_eq!(next, at(2024, 5, 10, 12, 31, 0));
    }

    #[test]
    fn test_steps_and_lists() {
        let schedule = CronSchedule::parse("*/15 9-17/4 * * 1,3,5").unwrap();
        // Friday 2024-05-10 09:50 -> 13:00 same day
        let next = schedule.next_after(&at(2024, 5, 10, 9, 50, 0)).unwrap();
        assert_eq!(next, at(2024, 5, 10, 13, 0, 0));
        // Friday 17:50 -> Monday 09:00
        let next = schedule.next_after(&at(2024, 5, 10, 17, 50, 0)).unwrap();
        assert_eq!(next, at(2024, 5, 13, 9, 0, 0));
    }

    #[test]
    fn test_value_with_step_runs_to_field_end() {
        let schedule = CronSchedule::parse("50/5 * * * *").unwrap();
        let fires: Vec<_> = schedule.ticker(at(2024, 1, 1, 0, 0, 0)).take(3).collect();
        assert_eq!(
            fires,
            vec![at(2024, 1, 1, 0, 50, 0), at(2024, 1, 1, 0, 55, 0), at(2024, 1, 1, 1, 50, 0)]
        );
    }

    #[test]
    fn test_month_rollover_and_names() {
        let next = next_fire_after("0 0 1 jan *", &at(2024, 3, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 1, 1, 0, 0, 0));

        let next = next_fire_after("0 6 * * SUN", &at(2024, 5, 10, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 5, 12, 6, 0, 0));
    }

    #[test]
    fn test_dom_or_dow_when_both_restricted() {
        // 15th of the month OR any Monday
        let schedule = CronSchedule::parse("0 0 15 * 1").unwrap();
        // 2024-05-10 is a Friday; next Monday is the 13th
        let next = schedule.next_after(&at(2024, 5, 10, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 5, 13, 0, 0, 0));
        let next = schedule.next_after(&next).unwrap();
        assert_eq!(next, at(2024, 5, 15, 0, 0, 0));
    }

    #[test]
    fn test_leap_day() {
        let next = next_fire_after("0 0 29 2 *", &at(2024, 3, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2028, 2, 29, 0, 0, 0));
    }

    #[test]
    fn test_macros() {
        let next = next_fire_after("@daily", &at(2024, 5, 10, 12, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 5, 11, 0, 0, 0));
        assert_eq!(CronSchedule::parse("@hourly").unwrap().expression(), "@hourly");
    }

    #[test]
    fn test_ticker_is_strictly_increasing() {
        let schedule = CronSchedule::parse("*/7 * * * *").unwrap();
        let fires: Vec<_> = schedule.ticker(at(2024, 5, 10, 23, 50, 0)).take(20).collect();
        assert!(fires.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(fires[0], at(2024, 5, 10, 23, 56, 0));
        assert_eq!(fires[1], at(2024, 5, 11, 0, 0, 0));
    }

    #[test]
    fn test_rejects_bad_expressions() {
        for expr in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * 32 * *",
            "* * * 13 *",
            "* * * * 7",
            "*/0 * * * *",
            "5-1 * * * *",
            "a * * * *",
            "1,,2 * * * *",
            "0 0 31 2 *",
        ] {
            assert!(
                matches!(
                    CronSchedule::parse(expr),
                    Err(WardenError::InvalidCronExpression { .. })
                ),
                "expected '{}' to be rejected",
                expr
            );
        }
    }

    #[test]
    fn test_fixed_offset_timezone() {
        let tz = chrono::FixedOffset::east_opt(2 * 3600).unwrap();
        let from = tz.with_ymd_and_hms(2024, 5, 10, 23, 30, 0).unwrap();
        let next = next_fire_after("0 0 * * *", &from).unwrap();
        assert_eq!(next, tz.with_ymd_and_hms(2024, 5, 11, 0, 0, 0).unwrap());
    }
}
