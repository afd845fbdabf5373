//! `taskwheel-store` — durable task and result records over SQLite.
//!
//! # Overview
//!
//! All process-wide mutable state lives in two tables, `tasks` and
//! `task_results`, reached exclusively through [`TaskStore`]. The store wraps
//! one rusqlite `Connection` in a `Mutex`; SQLite's WAL mode plus that lock
//! serialize every write. Multi-row writes (insert with prerequisite
//! validation, cascade delete) run inside a single transaction.
//!
//! # Write ownership
//!
//! To keep column writes uncontended by construction:
//! - `next_run_at` is written only by the dispatcher ([`TaskStore::set_next_run`]),
//! - `last_run_at` / `last_status` and result rows only by the runner,
//! - definition fields and `is_active` only via the API / batch operations.
//!
//! # Single-flight
//!
//! A task never has two `running` results: [`TaskStore::try_claim_run`] is an
//! atomic insert-unless-running claim, so concurrent callers race safely.

pub mod db;
pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::TaskStore;
pub use types::{EventType, RunStatus, Task, TaskDraft, TaskPatch, TaskResult, TriggerType};
