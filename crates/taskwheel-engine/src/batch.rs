//! Bulk operations over many task ids.
//!
//! A batch is best-effort, not atomic: each id is processed independently and
//! lands in exactly one outcome bucket. `run` goes through the same admission
//! gates as any other fire, so its buckets mirror [`FireOutcome`].

use serde::{Deserialize, Serialize};
use tracing::info;

use taskwheel_store::{StoreError, TaskStore};

use crate::fire::{FireOutcome, FireReason};
use crate::runner::RunnerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchAction {
    Delete,
    Enable,
    Disable,
    Run,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub action: BatchAction,
    pub task_ids: Vec<i64>,
}

/// Partition of the requested ids by what happened to each. Empty buckets are
/// omitted from the serialized form.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updated: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unchanged: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub queued: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub running: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked: Vec<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<i64>,
}

/// Apply `request` id by id. Ids are deduped (first occurrence wins) and
/// non-positive ids rejected up front; a store failure aborts the remainder.
pub fn apply_batch(
    store: &TaskStore,
    runner: &RunnerHandle,
    request: BatchRequest,
) -> Result<BatchOutcome, StoreError> {
    let mut ids: Vec<i64> = Vec::new();
    for id in request.task_ids {
        if id > 0 && !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Err(StoreError::Validation("task_ids must not be empty".into()));
    }

    info!(action = ?request.action, count = ids.len(), "batch operation");
    let mut outcome = BatchOutcome::default();
    for id in ids {
        match request.action {
            BatchAction::Delete => match store.delete_task(id) {
                Ok(()) => outcome.deleted.push(id),
                Err(StoreError::NotFound { .. }) => outcome.missing.push(id),
                Err(e) => return Err(e),
            },
            BatchAction::Enable | BatchAction::Disable => {
                let target = request.action == BatchAction::Enable;
                match store.set_active(id, target) {
                    Ok(true) => outcome.updated.push(id),
                    Ok(false) => outcome.unchanged.push(id),
                    Err(StoreError::NotFound { .. }) => outcome.missing.push(id),
                    Err(e) => return Err(e),
                }
            }
            BatchAction::Run => match runner.fire(id, FireReason::Manual)? {
                FireOutcome::Queued { .. } => outcome.queued.push(id),
                FireOutcome::AlreadyRunning => outcome.running.push(id),
                FireOutcome::Blocked { .. } => outcome.blocked.push(id),
                FireOutcome::NotFound => outcome.missing.push(id),
            },
        }
    }
    Ok(outcome)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::account::AccountDirectory;
    use crate::runner::Runner;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;
    use taskwheel_core::config::RunnerConfig;
    use taskwheel_store::{EventType, TaskDraft, TriggerType};

    fn fixture_accounts(dir: &tempfile::TempDir) -> AccountDirectory {
        let uid = unsafe { libc::geteuid() };
        let passwd = dir.path().join("passwd");
        let group = dir.path().join("group");
        let mut f = std::fs::File::create(&passwd).unwrap();
        writeln!(f, "tester:x:{uid}:{uid}:Tester:/tmp:/bin/bash").unwrap();
        let mut g = std::fs::File::create(&group).unwrap();
        writeln!(g, "tester:x:{uid}:").unwrap();
        AccountDirectory::with_paths(passwd, group)
    }

    fn draft(name: &str, script: &str) -> TaskDraft {
        TaskDraft {
            name: name.to_string(),
            account: "tester".to_string(),
            trigger_type: TriggerType::Schedule,
            schedule_expression: Some("0 0 1 1 *".to_string()),
            event_type: EventType::Script,
            condition_script: None,
            condition_interval: 60,
            is_active: true,
            pre_task_ids: Vec::new(),
            script_body: script.to_string(),
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<TaskStore>, RunnerHandle) {
        let dir = tempfile::tempdir().unwrap();
        let accounts = fixture_accounts(&dir);
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let (handle, runner) = Runner::new(Arc::clone(&store), accounts, RunnerConfig::default());
        tokio::spawn(runner.run());
        (dir, store, handle)
    }

    #[tokio::test]
    async fn delete_partitions_into_deleted_and_missing() {
        let (_guard, store, handle) = setup();
        let a = store.insert_task(draft("a", "true")).unwrap();

        let outcome = apply_batch(
            &store,
            &handle,
            BatchRequest {
                action: BatchAction::Delete,
                task_ids: vec![a.id, a.id, 404, -3],
            },
        )
        .unwrap();
        assert_eq!(outcome.deleted, vec![a.id]);
        assert_eq!(outcome.missing, vec![404]);
        assert!(outcome.updated.is_empty());
    }

    #[tokio::test]
    async fn enable_disable_report_unchanged() {
        let (_guard, store, handle) = setup();
        let a = store.insert_task(draft("a", "true")).unwrap();
        let b = store.insert_task(draft("b", "true")).unwrap();
        store.set_active(b.id, false).unwrap();

        let outcome = apply_batch(
            &store,
            &handle,
            BatchRequest {
                action: BatchAction::Disable,
                task_ids: vec![a.id, b.id, 500],
            },
        )
        .unwrap();
        assert_eq!(outcome.updated, vec![a.id]);
        assert_eq!(outcome.unchanged, vec![b.id]);
        assert_eq!(outcome.missing, vec![500]);
    }

    #[tokio::test]
    async fn run_buckets_mirror_admission() {
        let (_guard, store, handle) = setup();
        let slow = store.insert_task(draft("slow", "sleep 2")).unwrap();
        let gated = {
            let mut d = draft("gated", "true");
            d.pre_task_ids = vec![slow.id];
            store.insert_task(d).unwrap()
        };

        // First batch queues the slow task; the gated one is blocked.
        let first = apply_batch(
            &store,
            &handle,
            BatchRequest {
                action: BatchAction::Run,
                task_ids: vec![slow.id, gated.id, 777],
            },
        )
        .unwrap();
        assert_eq!(first.queued, vec![slow.id]);
        assert_eq!(first.blocked, vec![gated.id]);
        assert_eq!(first.missing, vec![777]);

        // While it sleeps, a second run is single-flight rejected.
        let second = apply_batch(
            &store,
            &handle,
            BatchRequest {
                action: BatchAction::Run,
                task_ids: vec![slow.id],
            },
        )
        .unwrap();
        assert_eq!(second.running, vec![slow.id]);

        // Drain so the spawned run does not outlive the test store.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        while store.has_running(slow.id).unwrap() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn empty_id_list_is_a_validation_error() {
        let (_guard, store, handle) = setup();
        let err = apply_batch(
            &store,
            &handle,
            BatchRequest {
                action: BatchAction::Run,
                task_ids: vec![0, -1],
            },
        )
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_FAILED");
    }

    #[test]
    fn outcome_serializes_without_empty_buckets() {
        let outcome = BatchOutcome {
            queued: vec![1],
            running: vec![2],
            ..BatchOutcome::default()
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json, serde_json::json!({"queued": [1], "running": [2]}));
    }
}
