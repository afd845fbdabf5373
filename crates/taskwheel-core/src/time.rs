//! Local wall-clock timestamp helpers.
//!
//! The scheduler runs against the host's local time with no timezone
//! bookkeeping: a task scheduled for `0 9 * * *` fires at 09:00 on the wall
//! clock, DST shifts and all. Timestamps persist as `YYYY-MM-DD HH:MM:SS`
//! strings, which sort and compare correctly as text.

use chrono::{Local, NaiveDateTime, SubsecRound};

/// Storage format for every persisted timestamp.
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local time, truncated to whole seconds.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local().trunc_subsecs(0)
}

pub fn format_ts(dt: NaiveDateTime) -> String {
    dt.format(TS_FORMAT).to_string()
}

/// Current local time pre-formatted for storage.
pub fn now_ts() -> String {
    format_ts(now())
}

/// Parse a stored timestamp. Accepts a `T` separator as well so values
/// pasted from ISO-8601 sources round-trip.
pub fn parse_ts(value: &str) -> Option<NaiveDateTime> {
    let normalized = value.trim().replace('T', " ");
    NaiveDateTime::parse_from_str(&normalized, TS_FORMAT).ok()
}
