use rusqlite::Connection;

/// Current schema version stamped into `PRAGMA user_version`.
///
/// Migrations are additive: bump the version and append an `ALTER TABLE`
/// block guarded by a version check. Never rewrite existing columns.
pub const SCHEMA_VERSION: i64 = 1;

/// Initialise the scheduler schema in `conn`. Idempotent — safe to call on
/// every startup.
///
/// `task_results` cascades on task delete, so removing a task atomically
/// removes its history. The `(task_id, started_at DESC)` index serves the
/// latest-result and history queries; the `next_run_at` index keeps the 1 Hz
/// due-task poll cheap.
pub fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            name                TEXT    NOT NULL UNIQUE,
            account             TEXT    NOT NULL,
            trigger_type        TEXT    NOT NULL,
            schedule_expression TEXT,
            event_type          TEXT    NOT NULL DEFAULT 'script',
            condition_script    TEXT,
            condition_interval  INTEGER NOT NULL DEFAULT 60,
            is_active           INTEGER NOT NULL DEFAULT 1,
            pre_task_ids        TEXT    NOT NULL DEFAULT '[]',  -- JSON array of task ids
            script_body         TEXT    NOT NULL,
            last_run_at         TEXT,
            last_status         TEXT,
            next_run_at         TEXT,               -- local time, schedule tasks only
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS task_results (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id        INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            status         TEXT    NOT NULL,        -- running | success | failed
            trigger_reason TEXT    NOT NULL,
            started_at     TEXT    NOT NULL,
            finished_at    TEXT,                    -- NULL while running
            log            TEXT,
            exit_code      INTEGER                  -- NULL on timeout / spawn failure
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_results_task_started
            ON task_results (task_id, started_at DESC);
        CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON tasks (next_run_at);
        ",
    )?;

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
    }
    Ok(())
}
