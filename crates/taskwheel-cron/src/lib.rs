//! `taskwheel-cron` — 5-field cron expressions and next-fire computation.
//!
//! # Field layout
//!
//! | Field        | Range | Notes                                        |
//! |--------------|-------|----------------------------------------------|
//! | minute       | 0–59  |                                              |
//! | hour         | 0–23  |                                              |
//! | day-of-month | 1–31  |                                              |
//! | month        | 1–12  |                                              |
//! | day-of-week  | 0–6   | **0 = Monday … 6 = Sunday**; `7` folds to 0  |
//!
//! # Weekday numbering
//!
//! The day-of-week field counts from Monday, NOT from Sunday as POSIX cron
//! does. Expressions already stored by deployments rely on this, so it is
//! load-bearing: `0 9 * * 0` means "09:00 every Monday". Keep it that way.
//!
//! # Calendar disjunction
//!
//! When both day-of-month and day-of-week are restricted, a date matches if
//! *either* field matches (the POSIX OR rule). When exactly one is
//! restricted, that one decides. When both are `*`, every date matches.
//!
//! Resolution is one minute. [`CronExpr::next_after`] scans day-by-day up to
//! a 36-month horizon and returns `None` past it, which callers treat as
//! "dormant".

mod expr;

pub use expr::{CronError, CronExpr, LOOKAHEAD_MONTHS};
