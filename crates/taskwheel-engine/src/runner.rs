//! The runner: admission gates plus the execution loop.
//!
//! Admission runs synchronously in [`RunnerHandle::fire`] so every caller
//! (dispatcher tick, condition pollers, manual/batch requests, cascades)
//! immediately learns the verdict. An admitted request already owns its
//! `running` result row when it enters the channel, which is what makes the
//! single-flight invariant hold under concurrent callers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use taskwheel_core::config::RunnerConfig;
use taskwheel_store::{RunStatus, StoreError, Task, TaskStore};

use crate::account::{resolve_privileges, AccountDirectory};
use crate::exec::{self, ExecContext, PidRegistry};
use crate::fire::{FireOutcome, FireReason};

/// An admitted fire-request travelling to the execution loop.
struct ExecJob {
    task: Task,
    result_id: i64,
    reason: FireReason,
}

struct RunnerShared {
    store: Arc<TaskStore>,
    accounts: AccountDirectory,
    config: RunnerConfig,
    registry: Arc<PidRegistry>,
    semaphore: Option<Arc<Semaphore>>,
    tx: mpsc::UnboundedSender<ExecJob>,
}

/// Consumes admitted jobs and executes them, each on its own tokio task.
pub struct Runner {
    shared: Arc<RunnerShared>,
    rx: mpsc::UnboundedReceiver<ExecJob>,
}

/// Cloneable front door to the runner.
#[derive(Clone)]
pub struct RunnerHandle {
    shared: Arc<RunnerShared>,
}

impl Runner {
    pub fn new(
        store: Arc<TaskStore>,
        accounts: AccountDirectory,
        config: RunnerConfig,
    ) -> (RunnerHandle, Runner) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RunnerShared {
            store,
            accounts,
            semaphore: config
                .max_parallel
                .map(|cap| Arc::new(Semaphore::new(cap.max(1)))),
            config,
            registry: Arc::new(PidRegistry::new()),
            tx,
        });
        (
            RunnerHandle {
                shared: Arc::clone(&shared),
            },
            Runner { shared, rx },
        )
    }

    /// Execution loop. Distinct tasks run in parallel (subject to the
    /// optional global cap); per-task serialization already happened at
    /// admission.
    pub async fn run(mut self) {
        info!("runner started");
        while let Some(job) = self.rx.recv().await {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                execute(shared, job).await;
            });
        }
        info!("runner channel closed");
    }
}

impl RunnerHandle {
    /// Admit one fire-request for `task_id`.
    ///
    /// Gate order is single-flight first, then prerequisites; a blocked
    /// request writes no record. Inactive tasks are accepted — only the
    /// dispatcher filters on activity.
    pub fn fire(&self, task_id: i64, reason: FireReason) -> Result<FireOutcome, StoreError> {
        let shared = &self.shared;
        let Some(task) = shared.store.get_task(task_id)? else {
            return Ok(FireOutcome::NotFound);
        };

        if shared.store.has_running(task_id)? {
            debug!(task_id, %reason, "fire dropped: already running");
            return Ok(FireOutcome::AlreadyRunning);
        }

        let mut unmet = Vec::new();
        for pre_id in &task.pre_task_ids {
            if shared.store.latest_success(*pre_id)?.is_none() {
                unmet.push(*pre_id);
            }
        }
        if !unmet.is_empty() {
            debug!(task_id, %reason, ?unmet, "fire dropped: prerequisites unmet");
            return Ok(FireOutcome::Blocked { unmet });
        }

        let Some(result_id) = shared.store.try_claim_run(task_id, &reason.to_string())? else {
            // Lost the race against a concurrent admission.
            return Ok(FireOutcome::AlreadyRunning);
        };

        let job = ExecJob {
            task,
            result_id,
            reason,
        };
        if shared.tx.send(job).is_err() {
            warn!(task_id, "runner loop is gone; failing the claimed run");
            shared
                .store
                .finalize_result(result_id, RunStatus::Failed, "runner unavailable", None)?;
            return Ok(FireOutcome::AlreadyRunning);
        }
        info!(task_id, %reason, result_id, "fire queued");
        Ok(FireOutcome::Queued { result_id })
    }

    /// Live children by result id — the shutdown path force-kills through
    /// this.
    pub fn registry(&self) -> Arc<PidRegistry> {
        Arc::clone(&self.shared.registry)
    }
}

async fn execute(shared: Arc<RunnerShared>, job: ExecJob) {
    let _permit = match &shared.semaphore {
        Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
        None => None,
    };

    let task_id = job.task.id;
    info!(task_id, reason = %job.reason, "executing task");

    let outcome = match resolve_privileges(&shared.accounts, &job.task.account) {
        Ok(privileges) => {
            let ctx = ExecContext {
                timeout: Duration::from_secs(shared.config.task_timeout_secs),
                log_cap: shared.config.log_cap_bytes,
                env: child_env(&job),
                privileges,
                registry: Some((Arc::clone(&shared.registry), job.result_id)),
            };
            exec::run_script(&job.task.script_body, ctx).await
        }
        // Permission problems become a failed result, never a crash.
        Err(message) => exec::ExecOutcome::failed(message),
    };

    let status = outcome.status;
    if let Err(e) =
        shared
            .store
            .finalize_result(job.result_id, status, &outcome.log, outcome.exit_code)
    {
        warn!(task_id, result_id = job.result_id, "finalize failed: {e}");
        return;
    }
    if let Err(e) = shared.store.update_last_run(task_id, status) {
        warn!(task_id, "last-run update failed: {e}");
    }
    info!(task_id, %status, exit_code = ?outcome.exit_code, "task finished");

    // Cascade only on success, only to direct dependents, and only after the
    // parent's result is finalized so children observe it.
    if status == RunStatus::Success {
        cascade(&shared, task_id);
    }
}

fn cascade(shared: &Arc<RunnerShared>, completed_id: i64) {
    let dependents = match shared.store.active_dependents_of(completed_id) {
        Ok(dependents) => dependents,
        Err(e) => {
            warn!(completed_id, "cascade scan failed: {e}");
            return;
        }
    };
    let handle = RunnerHandle {
        shared: Arc::clone(shared),
    };
    for dependent in dependents {
        match handle.fire(dependent.id, FireReason::Prerequisite(completed_id)) {
            Ok(FireOutcome::Queued { .. }) => {
                info!(parent = completed_id, child = dependent.id, "cascade fired");
            }
            Ok(other) => {
                debug!(parent = completed_id, child = dependent.id, ?other, "cascade skipped");
            }
            Err(e) => warn!(parent = completed_id, child = dependent.id, "cascade failed: {e}"),
        }
    }
}

/// Environment the task script sees about itself.
fn child_env(job: &ExecJob) -> Vec<(String, String)> {
    vec![
        ("TASKWHEEL_TASK_ID".to_string(), job.task.id.to_string()),
        ("TASKWHEEL_TASK_NAME".to_string(), job.task.name.clone()),
        (
            "TASKWHEEL_TASK_ACCOUNT".to_string(),
            job.task.account.clone(),
        ),
        ("TASKWHEEL_TRIGGER".to_string(), job.reason.to_string()),
    ]
}
