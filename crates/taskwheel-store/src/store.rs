use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use taskwheel_core::time;
use taskwheel_cron::CronExpr;

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::types::{EventType, RunStatus, Task, TaskDraft, TaskPatch, TaskResult, TriggerType};

const TASK_COLUMNS: &str = "id, name, account, trigger_type, schedule_expression, event_type,
        condition_script, condition_interval, is_active, pre_task_ids, script_body,
        last_run_at, last_status, next_run_at, created_at, updated_at";

const RESULT_COLUMNS: &str =
    "id, task_id, status, trigger_reason, started_at, finished_at, log, exit_code";

/// Thread-safe store for tasks and their execution history.
///
/// Wraps a single SQLite connection in a `Mutex`; every method takes the lock
/// for the duration of one statement or transaction.
pub struct TaskStore {
    db: Mutex<Connection>,
}

impl TaskStore {
    /// Open (creating if needed) the backing database file.
    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // -----------------------------------------------------------------------
    // Task definitions
    // -----------------------------------------------------------------------

    /// Validate and insert a new task. Prerequisite references are checked
    /// inside the same transaction as the insert.
    pub fn insert_task(&self, draft: TaskDraft) -> Result<Task> {
        let mut conn = self.db.lock().unwrap();
        let tx = conn.transaction()?;

        let name = draft.name.trim().to_string();
        if task_name_exists(&tx, &name, None)? {
            return Err(StoreError::Conflict(format!(
                "task name '{name}' already exists"
            )));
        }
        let canonical = canonicalize(&tx, draft, None, None)?;

        let now = time::now_ts();
        tx.execute(
            "INSERT INTO tasks (
                name, account, trigger_type, schedule_expression, event_type,
                condition_script, condition_interval, is_active, pre_task_ids,
                script_body, next_run_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                canonical.name,
                canonical.account,
                canonical.trigger_type.to_string(),
                canonical.schedule_expression,
                canonical.event_type.to_string(),
                canonical.condition_script,
                canonical.condition_interval,
                canonical.is_active as i64,
                serde_json::to_string(&canonical.pre_task_ids)
                    .map_err(|e| StoreError::Validation(e.to_string()))?,
                canonical.script_body,
                canonical.next_run_at,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!(task_id = id, "task inserted");
        fetch_task(&conn, id)?.ok_or(StoreError::NotFound { what: "task", id })
    }

    /// Merge a partial update onto an existing task, re-validate, and persist.
    ///
    /// Changing the cron expression forces a `next_run_at` recompute; an
    /// unchanged expression keeps the already-scheduled fire time.
    pub fn update_task(&self, id: i64, patch: TaskPatch) -> Result<Task> {
        let mut conn = self.db.lock().unwrap();
        let tx = conn.transaction()?;

        let existing = fetch_task(&tx, id)?.ok_or(StoreError::NotFound { what: "task", id })?;

        if let Some(ref new_name) = patch.name {
            if task_name_exists(&tx, new_name.trim(), Some(id))? {
                return Err(StoreError::Conflict(format!(
                    "task name '{}' already exists",
                    new_name.trim()
                )));
            }
        }

        let expr_changed = match &patch.schedule_expression {
            Some(new_expr) => existing.schedule_expression.as_deref() != Some(new_expr.as_str()),
            None => false,
        };

        let merged = TaskDraft {
            name: patch.name.unwrap_or_else(|| existing.name.clone()),
            account: patch.account.unwrap_or_else(|| existing.account.clone()),
            trigger_type: patch.trigger_type.unwrap_or(existing.trigger_type),
            schedule_expression: patch
                .schedule_expression
                .or_else(|| existing.schedule_expression.clone()),
            event_type: patch.event_type.unwrap_or(existing.event_type),
            condition_script: patch
                .condition_script
                .or_else(|| existing.condition_script.clone()),
            condition_interval: patch.condition_interval.unwrap_or(existing.condition_interval),
            is_active: patch.is_active.unwrap_or(existing.is_active),
            pre_task_ids: patch
                .pre_task_ids
                .unwrap_or_else(|| existing.pre_task_ids.clone()),
            script_body: patch.script_body.unwrap_or_else(|| existing.script_body.clone()),
        };

        let retain_next = if expr_changed {
            None
        } else {
            existing.next_run_at.as_deref()
        };
        let canonical = canonicalize(&tx, merged, Some(id), retain_next)?;

        tx.execute(
            "UPDATE tasks SET
                name = ?1, account = ?2, trigger_type = ?3, schedule_expression = ?4,
                event_type = ?5, condition_script = ?6, condition_interval = ?7,
                is_active = ?8, pre_task_ids = ?9, script_body = ?10,
                next_run_at = ?11, updated_at = ?12
             WHERE id = ?13",
            params![
                canonical.name,
                canonical.account,
                canonical.trigger_type.to_string(),
                canonical.schedule_expression,
                canonical.event_type.to_string(),
                canonical.condition_script,
                canonical.condition_interval,
                canonical.is_active as i64,
                serde_json::to_string(&canonical.pre_task_ids)
                    .map_err(|e| StoreError::Validation(e.to_string()))?,
                canonical.script_body,
                canonical.next_run_at,
                time::now_ts(),
                id,
            ],
        )?;
        tx.commit()?;

        fetch_task(&conn, id)?.ok_or(StoreError::NotFound { what: "task", id })
    }

    /// Delete a task; the `ON DELETE CASCADE` constraint removes its results
    /// in the same transaction.
    pub fn delete_task(&self, id: i64) -> Result<()> {
        let mut conn = self.db.lock().unwrap();
        let tx = conn.transaction()?;
        let deleted = tx.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(StoreError::NotFound { what: "task", id });
        }
        tx.commit()?;
        debug!(task_id = id, "task deleted with cascading results");
        Ok(())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.db.lock().unwrap();
        fetch_task(&conn, id)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.db.lock().unwrap();
        let mut stmt =
            conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id ASC"))?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }

    /// Dispatcher-owned write: set (or clear) the next scheduled fire time.
    /// A vanished task is a no-op — deletes race with the tick.
    pub fn set_next_run(&self, id: i64, next_run_at: Option<&str>) -> Result<()> {
        let conn = self.db.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET next_run_at = ?1, updated_at = ?2 WHERE id = ?3",
            params![next_run_at, time::now_ts(), id],
        )?;
        Ok(())
    }

    /// Flip `is_active`; returns `false` when the task was already in the
    /// target state. Deactivation clears `next_run_at`; activation of a
    /// schedule task recomputes it from now.
    pub fn set_active(&self, id: i64, active: bool) -> Result<bool> {
        let mut conn = self.db.lock().unwrap();
        let tx = conn.transaction()?;
        let existing = fetch_task(&tx, id)?.ok_or(StoreError::NotFound { what: "task", id })?;
        if existing.is_active == active {
            return Ok(false);
        }

        let next_run_at = if active && existing.trigger_type == TriggerType::Schedule {
            existing
                .schedule_expression
                .as_deref()
                .and_then(|expr| expr.parse::<CronExpr>().ok())
                .and_then(|cron| cron.next_after(time::now()))
                .map(time::format_ts)
        } else {
            None
        };

        tx.execute(
            "UPDATE tasks SET is_active = ?1, next_run_at = ?2, updated_at = ?3 WHERE id = ?4",
            params![active as i64, next_run_at, time::now_ts(), id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Runner-owned write: denormalise the most recent outcome onto the task.
    pub fn update_last_run(&self, id: i64, status: RunStatus) -> Result<()> {
        let conn = self.db.lock().unwrap();
        conn.execute(
            "UPDATE tasks SET last_run_at = ?1, last_status = ?2, updated_at = ?1 WHERE id = ?3",
            params![time::now_ts(), status.to_string(), id],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Atomically open a `running` result for `task_id` unless one already
    /// exists. Returns the new result id, or `None` when the task is already
    /// in flight (the single-flight gate).
    pub fn try_claim_run(&self, task_id: i64, trigger_reason: &str) -> Result<Option<i64>> {
        let conn = self.db.lock().unwrap();
        let inserted = conn.execute(
            "INSERT INTO task_results (task_id, status, trigger_reason, started_at)
             SELECT ?1, 'running', ?2, ?3
             WHERE NOT EXISTS (
                 SELECT 1 FROM task_results WHERE task_id = ?1 AND status = 'running'
             )",
            params![task_id, trigger_reason, time::now_ts()],
        )?;
        if inserted == 0 {
            Ok(None)
        } else {
            Ok(Some(conn.last_insert_rowid()))
        }
    }

    /// Close an open result with its terminal status, captured log, and exit
    /// code. Called exactly once per result.
    pub fn finalize_result(
        &self,
        result_id: i64,
        status: RunStatus,
        log: &str,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let conn = self.db.lock().unwrap();
        let updated = conn.execute(
            "UPDATE task_results SET status = ?1, finished_at = ?2, log = ?3, exit_code = ?4
             WHERE id = ?5",
            params![status.to_string(), time::now_ts(), log, exit_code, result_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                what: "result",
                id: result_id,
            });
        }
        Ok(())
    }

    /// Result history for one task, newest first.
    pub fn list_results(&self, task_id: i64, limit: u32, offset: u32) -> Result<Vec<TaskResult>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM task_results WHERE task_id = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let results = stmt
            .query_map(params![task_id, limit, offset], row_to_result)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    pub fn latest_result(&self, task_id: i64) -> Result<Option<TaskResult>> {
        let conn = self.db.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {RESULT_COLUMNS} FROM task_results WHERE task_id = ?1
                 ORDER BY started_at DESC, id DESC LIMIT 1"
            ),
            [task_id],
            row_to_result,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Finish time of the most recent successful run, if the task has ever
    /// succeeded. This is what the prerequisite gate consults.
    pub fn latest_success(&self, task_id: i64) -> Result<Option<String>> {
        let conn = self.db.lock().unwrap();
        conn.query_row(
            "SELECT finished_at FROM task_results
             WHERE task_id = ?1 AND status = 'success'
             ORDER BY started_at DESC, id DESC LIMIT 1",
            [task_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .map(|opt| opt.flatten())
        .map_err(StoreError::from)
    }

    pub fn has_running(&self, task_id: i64) -> Result<bool> {
        let conn = self.db.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM task_results WHERE task_id = ?1 AND status = 'running'",
            [task_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All currently open results across tasks — the shutdown drain watches
    /// this set.
    pub fn running_results(&self) -> Result<Vec<TaskResult>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESULT_COLUMNS} FROM task_results WHERE status = 'running' ORDER BY id ASC"
        ))?;
        let results = stmt
            .query_map([], row_to_result)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(results)
    }

    pub fn delete_result(&self, task_id: i64, result_id: i64) -> Result<()> {
        let conn = self.db.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM task_results WHERE task_id = ?1 AND id = ?2",
            params![task_id, result_id],
        )?;
        if deleted == 0 {
            return Err(StoreError::NotFound {
                what: "result",
                id: result_id,
            });
        }
        Ok(())
    }

    /// Remove the full history of one task; returns the number of rows gone.
    pub fn clear_results(&self, task_id: i64) -> Result<usize> {
        let conn = self.db.lock().unwrap();
        let deleted = conn.execute("DELETE FROM task_results WHERE task_id = ?1", [task_id])?;
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Dispatcher queries
    // -----------------------------------------------------------------------

    /// Active schedule tasks whose `next_run_at` has arrived.
    pub fn due_tasks(&self, now: &str) -> Result<Vec<Task>> {
        let conn = self.db.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE trigger_type = 'schedule' AND is_active = 1
               AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at ASC"
        ))?;
        let tasks = stmt
            .query_map([now], row_to_task)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }

    /// Active event tasks, optionally narrowed to one event type.
    pub fn event_tasks(&self, event_type: Option<EventType>) -> Result<Vec<Task>> {
        let conn = self.db.lock().unwrap();
        let tasks = match event_type {
            Some(et) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE trigger_type = 'event' AND is_active = 1 AND event_type = ?1
                     ORDER BY id ASC"
                ))?;
                let rows = stmt
                    .query_map([et.to_string()], row_to_task)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE trigger_type = 'event' AND is_active = 1 ORDER BY id ASC"
                ))?;
                let rows = stmt
                    .query_map([], row_to_task)?
                    .filter_map(|r| r.ok())
                    .collect();
                rows
            }
        };
        Ok(tasks)
    }

    /// Active tasks listing `task_id` among their prerequisites — the cascade
    /// fan-out set. `pre_task_ids` is a JSON column, so the filter runs here
    /// rather than in SQL.
    pub fn active_dependents_of(&self, task_id: i64) -> Result<Vec<Task>> {
        let tasks = self.list_tasks()?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.is_active && t.pre_task_ids.contains(&task_id))
            .collect())
    }

    pub fn count_tasks(&self) -> Result<i64> {
        let conn = self.db.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(1) FROM tasks", [], |row| row.get(0))?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Row mapping and validation helpers
// ---------------------------------------------------------------------------

/// Map a SELECT row (column order from `TASK_COLUMNS`) to a `Task`.
fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let trigger: String = row.get(3)?;
    let event: String = row.get(5)?;
    let pre_json: String = row.get(9)?;
    let last_status: Option<String> = row.get(12)?;
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        account: row.get(2)?,
        trigger_type: trigger.parse().unwrap_or(TriggerType::Schedule),
        schedule_expression: row.get(4)?,
        event_type: event.parse().unwrap_or(EventType::Script),
        condition_script: row.get(6)?,
        condition_interval: row.get(7)?,
        is_active: row.get::<_, i64>(8)? != 0,
        pre_task_ids: serde_json::from_str(&pre_json).unwrap_or_default(),
        script_body: row.get(10)?,
        last_run_at: row.get(11)?,
        last_status: last_status.and_then(|s| s.parse().ok()),
        next_run_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn row_to_result(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskResult> {
    let status: String = row.get(2)?;
    Ok(TaskResult {
        id: row.get(0)?,
        task_id: row.get(1)?,
        status: status.parse().unwrap_or(RunStatus::Failed),
        trigger_reason: row.get(3)?,
        started_at: row.get(4)?,
        finished_at: row.get(5)?,
        log: row.get(6)?,
        exit_code: row.get(7)?,
    })
}

fn fetch_task(conn: &Connection, id: i64) -> Result<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
        [id],
        row_to_task,
    )
    .optional()
    .map_err(StoreError::from)
}

fn task_name_exists(conn: &Connection, name: &str, exclude_id: Option<i64>) -> Result<bool> {
    let count: i64 = match exclude_id {
        Some(id) => conn.query_row(
            "SELECT COUNT(1) FROM tasks WHERE name = ?1 AND id <> ?2",
            params![name, id],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(1) FROM tasks WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?,
    };
    Ok(count > 0)
}

/// Fully validated task fields, ready to persist.
struct CanonicalTask {
    name: String,
    account: String,
    trigger_type: TriggerType,
    schedule_expression: Option<String>,
    event_type: EventType,
    condition_script: Option<String>,
    condition_interval: u32,
    is_active: bool,
    pre_task_ids: Vec<i64>,
    script_body: String,
    next_run_at: Option<String>,
}

/// Enforce the task invariants on a draft: required fields by trigger type,
/// parseable cron, existing non-self prerequisites, probe interval floor.
///
/// `retain_next` carries an already-scheduled fire time through updates whose
/// expression did not change; otherwise `next_run_at` is computed fresh. The
/// result honours the rule that `next_run_at` is non-NULL only for active
/// schedule tasks.
fn canonicalize(
    conn: &Connection,
    draft: TaskDraft,
    self_id: Option<i64>,
    retain_next: Option<&str>,
) -> Result<CanonicalTask> {
    let name = draft.name.trim().to_string();
    if name.is_empty() {
        return Err(StoreError::Validation("task name is required".into()));
    }
    let account = draft.account.trim().to_string();
    if account.is_empty() {
        return Err(StoreError::Validation("account is required".into()));
    }
    let script_body = draft.script_body.trim().to_string();
    if script_body.is_empty() {
        return Err(StoreError::Validation("script body must not be empty".into()));
    }

    let condition_interval = draft.condition_interval.max(10);

    let mut pre_task_ids: Vec<i64> = Vec::new();
    for pre_id in draft.pre_task_ids {
        if Some(pre_id) == self_id || pre_task_ids.contains(&pre_id) {
            continue;
        }
        let exists: i64 = conn.query_row(
            "SELECT COUNT(1) FROM tasks WHERE id = ?1",
            [pre_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(StoreError::Validation(format!(
                "prerequisite task {pre_id} does not exist"
            )));
        }
        pre_task_ids.push(pre_id);
    }

    let (trigger_type, schedule_expression, event_type, condition_script, next_run_at) =
        match draft.trigger_type {
            TriggerType::Schedule => {
                let expr = draft
                    .schedule_expression
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        StoreError::Validation("schedule tasks require a cron expression".into())
                    })?
                    .to_string();
                let cron: CronExpr = expr.parse().map_err(|e| {
                    StoreError::Validation(format!("invalid cron expression: {e}"))
                })?;
                let next = if draft.is_active {
                    match retain_next {
                        Some(kept) => Some(kept.to_string()),
                        None => cron.next_after(time::now()).map(time::format_ts),
                    }
                } else {
                    None
                };
                (TriggerType::Schedule, Some(expr), EventType::Script, None, next)
            }
            TriggerType::Event => {
                let condition_script = match draft.event_type {
                    EventType::Script => {
                        let script = draft
                            .condition_script
                            .as_deref()
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .ok_or_else(|| {
                                StoreError::Validation(
                                    "script-event tasks require a condition script".into(),
                                )
                            })?
                            .to_string();
                        Some(script)
                    }
                    EventType::SystemBoot | EventType::SystemShutdown => None,
                };
                (
                    TriggerType::Event,
                    None,
                    draft.event_type,
                    condition_script,
                    None,
                )
            }
        };

    Ok(CanonicalTask {
        name,
        account,
        trigger_type,
        schedule_expression,
        event_type,
        condition_script,
        condition_interval,
        is_active: draft.is_active,
        pre_task_ids,
        script_body,
        next_run_at,
    })
}
