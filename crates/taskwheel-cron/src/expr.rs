use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDateTime, NaiveTime, Timelike};
use thiserror::Error;

/// Search horizon for [`CronExpr::next_after`]. An expression with no match
/// inside this window (e.g. `0 0 31 2 *`) is considered dormant.
pub const LOOKAHEAD_MONTHS: u32 = 36;

/// Errors produced while parsing a cron expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronError {
    #[error("cron expression must contain 5 fields, got {0}")]
    FieldCount(usize),

    #[error("invalid {field} segment: {segment}")]
    InvalidSegment { field: &'static str, segment: String },

    #[error("invalid step in {field} field")]
    InvalidStep { field: &'static str },

    #[error("{field} range start greater than end")]
    ReversedRange { field: &'static str },

    #[error("{field} value out of range")]
    OutOfRange { field: &'static str },
}

/// Bounds and cardinality of one cron field.
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    span: usize,
}

const FIELD_SPECS: [FieldSpec; 5] = [
    FieldSpec { name: "minute", min: 0, max: 59, span: 60 },
    FieldSpec { name: "hour", min: 0, max: 23, span: 24 },
    FieldSpec { name: "day-of-month", min: 1, max: 31, span: 31 },
    FieldSpec { name: "month", min: 1, max: 12, span: 12 },
    FieldSpec { name: "day-of-week", min: 0, max: 6, span: 7 },
];

/// A parsed 5-field cron expression.
///
/// Day-of-week counts from Monday (0) through Sunday (6); see the crate docs
/// for why this diverges from POSIX and must stay that way.
#[derive(Debug, Clone)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days: Vec<u32>,
    months: Vec<u32>,
    weekdays: Vec<u32>,
    dom_wildcard: bool,
    dow_wildcard: bool,
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount(parts.len()));
        }

        let mut fields = Vec::with_capacity(5);
        let mut wildcards = Vec::with_capacity(5);
        for (token, spec) in parts.iter().zip(FIELD_SPECS.iter()) {
            let (values, wildcard) = expand_field(token, spec)?;
            fields.push(values);
            wildcards.push(wildcard);
        }

        let mut fields = fields.into_iter();
        Ok(Self {
            minutes: fields.next().unwrap_or_default(),
            hours: fields.next().unwrap_or_default(),
            days: fields.next().unwrap_or_default(),
            months: fields.next().unwrap_or_default(),
            weekdays: fields.next().unwrap_or_default(),
            dom_wildcard: wildcards[2],
            dow_wildcard: wildcards[4],
        })
    }
}

impl CronExpr {
    /// Smallest instant strictly after `t` that satisfies the expression, at
    /// whole-minute resolution. `None` when nothing matches within
    /// [`LOOKAHEAD_MONTHS`].
    pub fn next_after(&self, t: NaiveDateTime) -> Option<NaiveDateTime> {
        let floor = t
            .date()
            .and_time(NaiveTime::from_hms_opt(t.hour(), t.minute(), 0)?);
        let horizon = floor.date().checked_add_months(Months::new(LOOKAHEAD_MONTHS))?;

        let mut date = floor.date();
        while date <= horizon {
            if self.months.contains(&date.month()) && self.date_matches(date) {
                // Hour/minute sets are sorted, so candidates come out ascending.
                for &hour in &self.hours {
                    for &minute in &self.minutes {
                        let candidate = date.and_hms_opt(hour, minute, 0)?;
                        if candidate > floor {
                            return Some(candidate);
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    /// The first `count` fire times after `t`, for previews.
    pub fn next_times(&self, t: NaiveDateTime, count: usize) -> Vec<NaiveDateTime> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = t;
        for _ in 0..count {
            match self.next_after(cursor) {
                Some(next) => {
                    cursor = next;
                    out.push(next);
                }
                None => break,
            }
        }
        out
    }

    /// Day-of-month / day-of-week disjunction per the POSIX OR rule.
    fn date_matches(&self, date: chrono::NaiveDate) -> bool {
        let dom = self.days.contains(&date.day());
        let dow = self
            .weekdays
            .contains(&date.weekday().num_days_from_monday());
        match (self.dom_wildcard, self.dow_wildcard) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }
}

/// Expand one field token into its sorted value set plus a wildcard flag.
///
/// A field counts as wildcard when any comma item is literally `*` or the
/// expanded set covers the field's full span (`*/1`, `0-59`).
fn expand_field(token: &str, spec: &FieldSpec) -> Result<(Vec<u32>, bool), CronError> {
    let mut values: BTreeSet<u32> = BTreeSet::new();
    let mut wildcard = false;

    for raw_item in token.split(',') {
        let original = {
            let trimmed = raw_item.trim();
            if trimmed.is_empty() {
                "*"
            } else {
                trimmed
            }
        };

        let (base, step) = match original.split_once('/') {
            Some((base, step_str)) => {
                let step: u32 = step_str
                    .parse()
                    .map_err(|_| CronError::InvalidStep { field: spec.name })?;
                if step == 0 {
                    return Err(CronError::InvalidStep { field: spec.name });
                }
                (if base.is_empty() { "*" } else { base }, step)
            }
            None => (original, 1),
        };

        let expanded = expand_range(base, spec)?;
        let anchor = expanded[0];
        for value in expanded {
            if (value - anchor) % step == 0 {
                values.insert(value);
            }
        }
        wildcard = wildcard || original == "*";
    }

    // The day-of-week field accepts 7 as an alias for Monday (0) — kept for
    // compatibility with stored expressions.
    if spec.name == "day-of-week" && values.remove(&7) {
        values.insert(0);
    }

    if values.is_empty() {
        return Err(CronError::InvalidSegment {
            field: spec.name,
            segment: token.to_string(),
        });
    }
    if values.iter().any(|v| *v < spec.min || *v > spec.max) {
        return Err(CronError::OutOfRange { field: spec.name });
    }

    let full_span = values.len() == spec.span;
    Ok((values.into_iter().collect(), wildcard || full_span))
}

/// Expand `*`, a single integer, or an `a-b` range.
fn expand_range(item: &str, spec: &FieldSpec) -> Result<Vec<u32>, CronError> {
    if item == "*" {
        return Ok((spec.min..=spec.max).collect());
    }
    if item.chars().all(|c| c.is_ascii_digit()) {
        let value: u32 = item.parse().map_err(|_| CronError::InvalidSegment {
            field: spec.name,
            segment: item.to_string(),
        })?;
        return Ok(vec![value]);
    }
    if let Some((start_str, end_str)) = item.split_once('-') {
        let start: u32 = start_str.parse().map_err(|_| CronError::InvalidSegment {
            field: spec.name,
            segment: item.to_string(),
        })?;
        let end: u32 = end_str.parse().map_err(|_| CronError::InvalidSegment {
            field: spec.name,
            segment: item.to_string(),
        })?;
        if start > end {
            return Err(CronError::ReversedRange { field: spec.name });
        }
        return Ok((start..=end).collect());
    }
    Err(CronError::InvalidSegment {
        field: spec.name,
        segment: item.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    fn expr(s: &str) -> CronExpr {
        s.parse().unwrap()
    }

    #[test]
    fn quarter_hour_rounds_up() {
        // "*/15" anchored at 0 → {0, 15, 30, 45}.
        let next = expr("*/15 * * * *")
            .next_after(at(2025, 1, 1, 10, 7, 30))
            .unwrap();
        assert_eq!(next, at(2025, 1, 1, 10, 15, 0));
    }

    #[test]
    fn exact_minute_is_excluded() {
        let next = expr("*/15 * * * *")
            .next_after(at(2025, 1, 1, 10, 15, 0))
            .unwrap();
        assert_eq!(next, at(2025, 1, 1, 10, 30, 0));
    }

    #[test]
    fn day_or_weekday_takes_day() {
        // Day 1 of the month OR weekday 5 (Saturday, since 0 = Monday).
        let next = expr("0 9 1 * 5")
            .next_after(at(2025, 3, 31, 8, 0, 0))
            .unwrap();
        assert_eq!(next, at(2025, 4, 1, 9, 0, 0));
    }

    #[test]
    fn day_or_weekday_takes_weekday() {
        let next = expr("0 9 1 * 5")
            .next_after(at(2025, 4, 2, 0, 0, 0))
            .unwrap();
        // 2025-04-05 is a Saturday.
        assert_eq!(next, at(2025, 4, 5, 9, 0, 0));
    }

    #[test]
    fn zero_means_monday() {
        // 2025-06-02 is a Monday.
        let next = expr("0 9 * * 0")
            .next_after(at(2025, 6, 1, 12, 0, 0))
            .unwrap();
        assert_eq!(next, at(2025, 6, 2, 9, 0, 0));
    }

    #[test]
    fn seven_folds_to_monday() {
        let a = expr("0 9 * * 0").next_after(at(2025, 6, 1, 12, 0, 0));
        let b = expr("0 9 * * 7").next_after(at(2025, 6, 1, 12, 0, 0));
        assert_eq!(a, b);
    }

    #[test]
    fn restricted_weekday_with_wildcard_day() {
        // dom is `*`, dow is restricted → only the weekday decides.
        // 2025-06-08 is a Sunday (6 under this numbering).
        let next = expr("30 7 * * 6")
            .next_after(at(2025, 6, 2, 0, 0, 0))
            .unwrap();
        assert_eq!(next, at(2025, 6, 8, 7, 30, 0));
    }

    #[test]
    fn steps_anchor_at_range_start() {
        let next = expr("10-30/7 2 * * *")
            .next_after(at(2025, 1, 1, 2, 10, 0))
            .unwrap();
        assert_eq!(next, at(2025, 1, 1, 2, 17, 0));
        let next = expr("10-30/7 2 * * *").next_after(next).unwrap();
        assert_eq!(next, at(2025, 1, 1, 2, 24, 0));
    }

    #[test]
    fn month_rollover() {
        let next = expr("0 0 1 2 *")
            .next_after(at(2025, 3, 1, 0, 0, 0))
            .unwrap();
        assert_eq!(next, at(2026, 2, 1, 0, 0, 0));
    }

    #[test]
    fn impossible_date_is_dormant() {
        assert_eq!(expr("0 0 31 2 *").next_after(at(2025, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn preview_is_strictly_increasing_and_matching() {
        let times = expr("*/20 9-17 * * 0-4").next_times(at(2025, 5, 1, 0, 0, 0), 40);
        assert_eq!(times.len(), 40);
        for pair in times.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        for t in &times {
            assert_eq!(t.minute() % 20, 0);
            assert!((9..=17).contains(&t.hour()));
            // 0-4 means Monday through Friday.
            assert!(t.weekday().num_days_from_monday() <= 4);
        }
    }

    #[test]
    fn lists_and_ranges_combine() {
        let e = expr("0 6,18 1-7 * *");
        let next = e.next_after(at(2025, 7, 3, 7, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 7, 3, 18, 0, 0));
        let next = e.next_after(next).unwrap();
        assert_eq!(next, at(2025, 7, 4, 6, 0, 0));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!("* * * *".parse::<CronExpr>().is_err());
        assert!("* * * * * *".parse::<CronExpr>().is_err());
        assert!("61 * * * *".parse::<CronExpr>().is_err());
        assert!("* 25 * * *".parse::<CronExpr>().is_err());
        assert!("* * 0 * *".parse::<CronExpr>().is_err());
        assert!("* * * 13 *".parse::<CronExpr>().is_err());
        assert!("* * * * 8".parse::<CronExpr>().is_err());
        assert!("*/0 * * * *".parse::<CronExpr>().is_err());
        assert!("*/x * * * *".parse::<CronExpr>().is_err());
        assert!("5-1 * * * *".parse::<CronExpr>().is_err());
        assert!("a * * * *".parse::<CronExpr>().is_err());
        assert!("1.5 * * * *".parse::<CronExpr>().is_err());
    }

    #[test]
    fn specific_errors_are_reported() {
        assert_eq!(
            "61 * * * *".parse::<CronExpr>().unwrap_err(),
            CronError::OutOfRange { field: "minute" }
        );
        assert_eq!(
            "5-1 * * * *".parse::<CronExpr>().unwrap_err(),
            CronError::ReversedRange { field: "minute" }
        );
        assert_eq!("* * *".parse::<CronExpr>().unwrap_err(), CronError::FieldCount(3));
    }
}
