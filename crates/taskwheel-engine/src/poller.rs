//! Per-task condition pollers.
//!
//! Each active `script` event task gets its own tokio task probing on its own
//! cadence, so one aggressive 3-second probe never forces a faster global
//! tick. Pollers hold no persistent state: the dispatcher rebuilds the set on
//! startup and reconciles it every tick.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use taskwheel_store::{RunStatus, Task};

use crate::account::{resolve_privileges, AccountDirectory};
use crate::exec::{self, ExecContext};
use crate::fire::{FireOutcome, FireReason};
use crate::runner::RunnerHandle;

/// Probe output is only inspected for the exit code; keep a token amount for
/// debug logging.
const PROBE_LOG_CAP: usize = 4 * 1024;

/// The definition a poller was spawned from. A differing spec means the task
/// changed and the poller must be restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerSpec {
    pub task_id: i64,
    pub account: String,
    pub script: String,
    pub interval_secs: u32,
}

impl PollerSpec {
    /// Extract the probe definition from a task; `None` unless the task is
    /// an active script-event task with a probe configured.
    pub fn for_task(task: &Task) -> Option<Self> {
        let script = task.condition_script.clone()?;
        Some(Self {
            task_id: task.id,
            account: task.account.clone(),
            script,
            interval_secs: task.condition_interval.max(1),
        })
    }
}

/// What a probe needs besides its script.
#[derive(Clone)]
pub struct ProbeContext {
    pub accounts: AccountDirectory,
    pub timeout: Duration,
}

/// Start the poll loop for one task. The caller owns the handle and aborts
/// it when the task is deactivated, redefined, or deleted.
pub fn spawn(spec: PollerSpec, runner: RunnerHandle, ctx: ProbeContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(spec.interval_secs as u64));
        // A probe that overruns its interval skips the missed windows instead
        // of bursting — probes are single-flight per task.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if probe(&spec, &ctx).await {
                match runner.fire(spec.task_id, FireReason::ConditionMet) {
                    Ok(FireOutcome::Queued { .. }) => {
                        info!(task_id = spec.task_id, "condition met; task fired");
                    }
                    Ok(outcome) => {
                        debug!(task_id = spec.task_id, ?outcome, "condition fire dropped");
                    }
                    Err(e) => warn!(task_id = spec.task_id, "condition fire failed: {e}"),
                }
            }
        }
    })
}

/// Run the condition script once. Only a clean zero exit triggers; timeouts,
/// non-zero exits, and spawn or account problems are all non-triggers and
/// leave no trace beyond a log line.
async fn probe(spec: &PollerSpec, ctx: &ProbeContext) -> bool {
    let privileges = match resolve_privileges(&ctx.accounts, &spec.account) {
        Ok(privileges) => privileges,
        Err(message) => {
            warn!(task_id = spec.task_id, "condition probe skipped: {message}");
            return false;
        }
    };
    let outcome = exec::run_script(
        &spec.script,
        ExecContext {
            timeout: ctx.timeout,
            log_cap: PROBE_LOG_CAP,
            env: Vec::new(),
            privileges,
            registry: None,
        },
    )
    .await;
    debug!(
        task_id = spec.task_id,
        exit_code = ?outcome.exit_code,
        "condition probe finished"
    );
    outcome.status == RunStatus::Success
}
