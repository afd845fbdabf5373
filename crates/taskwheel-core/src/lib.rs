//! `taskwheel-core` — configuration, shared errors, and timestamp helpers.
//!
//! Everything in taskwheel that deals with wall-clock time goes through
//! [`time`]: timestamps are **local time**, second precision, formatted as
//! `YYYY-MM-DD HH:MM:SS` with no timezone suffix. Stored expressions and
//! result rows compare correctly as plain text in that format.

pub mod config;
pub mod error;
pub mod time;

pub use config::TaskwheelConfig;
pub use error::{CoreError, Result};
