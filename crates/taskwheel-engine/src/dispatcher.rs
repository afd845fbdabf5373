//! The dispatcher: a 1 Hz tick over schedule tasks plus lifecycle fires.
//!
//! Each tick fires every due schedule task once and recomputes its
//! `next_run_at` **from the current tick**, so a stopped process that missed
//! many windows coalesces them into a single catch-up fire. The tick also
//! reconciles the condition-poller set against the store.
//!
//! Shutdown sequence: stop the tick, abort the pollers, fire
//! `system_shutdown` tasks, wait up to the grace period for the runner to
//! drain, then force-terminate whatever is left.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskwheel_core::config::RunnerConfig;
use taskwheel_core::time;
use taskwheel_cron::CronExpr;
use taskwheel_store::{EventType, RunStatus, StoreError, TaskResult, TaskStore};

use crate::account::AccountDirectory;
use crate::fire::{FireOutcome, FireReason};
use crate::poller::{self, PollerSpec, ProbeContext};
use crate::runner::RunnerHandle;

/// Log line written into results that shutdown had to force-finalize.
const SHUTDOWN_MARKER: &str = "[terminated by scheduler shutdown]";

struct PollerEntry {
    spec: PollerSpec,
    handle: JoinHandle<()>,
}

pub struct Dispatcher {
    store: Arc<TaskStore>,
    runner: RunnerHandle,
    config: RunnerConfig,
    probe_ctx: ProbeContext,
    pollers: DashMap<i64, PollerEntry>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<TaskStore>,
        runner: RunnerHandle,
        accounts: AccountDirectory,
        config: RunnerConfig,
    ) -> Self {
        let probe_ctx = ProbeContext {
            accounts,
            timeout: Duration::from_secs(config.condition_timeout_secs),
        };
        Self {
            store,
            runner,
            config,
            probe_ctx,
            pollers: DashMap::new(),
        }
    }

    /// Main control loop. Emits boot fires before the first tick, then ticks
    /// at 1 Hz until `shutdown` flips true, then runs the shutdown sequence.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("dispatcher started");
        self.fire_lifecycle(EventType::SystemBoot, FireReason::Boot);

        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        // Store hiccups are retried on the next tick.
                        error!("dispatcher tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// One evaluation pass: due schedule tasks and poller reconciliation.
    fn tick(&self) -> Result<(), StoreError> {
        let now = time::now();
        for task in self.store.due_tasks(&time::format_ts(now))? {
            let Some(expr) = task.schedule_expression.as_deref() else {
                continue;
            };
            match expr.parse::<CronExpr>() {
                Ok(cron) => {
                    match self.runner.fire(task.id, FireReason::Cron) {
                        Ok(FireOutcome::Queued { .. }) => {}
                        Ok(outcome) => {
                            debug!(task_id = task.id, ?outcome, "cron fire dropped")
                        }
                        Err(e) => warn!(task_id = task.id, "cron fire failed: {e}"),
                    }
                    // Recompute from now: missed windows collapse into the
                    // single fire above.
                    let next = cron.next_after(now).map(time::format_ts);
                    if next.is_none() {
                        warn!(
                            task_id = task.id,
                            expr, "no fire time within the horizon; task is dormant"
                        );
                    }
                    self.store.set_next_run(task.id, next.as_deref())?;
                }
                Err(e) => {
                    // Stored expressions are re-parsed defensively. Clearing
                    // next_run_at removes the task from the due scan, so this
                    // logs once per bad expression.
                    warn!(
                        task_id = task.id,
                        expr, "malformed stored cron expression ({e}); task is dormant"
                    );
                    self.store.set_next_run(task.id, None)?;
                }
            }
        }
        self.reconcile_pollers()?;
        Ok(())
    }

    /// Keep exactly one poller alive per active script-event task, restart
    /// on definition changes, and reap pollers whose task is gone.
    fn reconcile_pollers(&self) -> Result<(), StoreError> {
        let tasks = self.store.event_tasks(Some(EventType::Script))?;

        let mut live = std::collections::HashSet::new();
        for task in &tasks {
            let Some(spec) = PollerSpec::for_task(task) else {
                continue;
            };
            live.insert(task.id);
            let unchanged = self
                .pollers
                .get(&task.id)
                .is_some_and(|entry| entry.spec == spec);
            if unchanged {
                continue;
            }
            if let Some((_, old)) = self.pollers.remove(&task.id) {
                old.handle.abort();
                debug!(task_id = task.id, "poller restarted after definition change");
            } else {
                info!(task_id = task.id, interval = spec.interval_secs, "poller started");
            }
            let handle = poller::spawn(spec.clone(), self.runner.clone(), self.probe_ctx.clone());
            self.pollers.insert(task.id, PollerEntry { spec, handle });
        }

        let stale: Vec<i64> = self
            .pollers
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| !live.contains(id))
            .collect();
        for id in stale {
            if let Some((_, entry)) = self.pollers.remove(&id) {
                entry.handle.abort();
                info!(task_id = id, "poller reaped");
            }
        }
        Ok(())
    }

    fn fire_lifecycle(&self, event: EventType, reason: FireReason) {
        let tasks = match self.store.event_tasks(Some(event)) {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(%event, "lifecycle scan failed: {e}");
                return;
            }
        };
        for task in tasks {
            match self.runner.fire(task.id, reason) {
                Ok(FireOutcome::Queued { .. }) => {
                    info!(task_id = task.id, %reason, "lifecycle fire queued");
                }
                Ok(outcome) => {
                    debug!(task_id = task.id, %reason, ?outcome, "lifecycle fire dropped");
                }
                Err(e) => warn!(task_id = task.id, %reason, "lifecycle fire failed: {e}"),
            }
        }
    }

    async fn shutdown(self) {
        info!("dispatcher stopping");

        // Probes must not fire new work into a draining runner.
        for entry in self.pollers.iter() {
            entry.value().handle.abort();
        }
        self.pollers.clear();

        self.fire_lifecycle(EventType::SystemShutdown, FireReason::Shutdown);

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            match self.store.running_results() {
                Ok(open) if open.is_empty() => {
                    info!("runner drained; dispatcher stopped");
                    return;
                }
                Ok(open) => {
                    if tokio::time::Instant::now() >= deadline {
                        self.force_terminate(open).await;
                        return;
                    }
                }
                Err(e) => warn!("drain check failed: {e}"),
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    }

    /// Grace expired: kill surviving children, give their executors a moment
    /// to finalize naturally, then close whatever rows are still open.
    async fn force_terminate(&self, open: Vec<TaskResult>) {
        warn!(count = open.len(), "grace period expired; force-terminating runs");
        let registry = self.runner.registry();
        for result in &open {
            if let Some(pid) = registry.get(&result.id) {
                #[cfg(unix)]
                // Safety: pids in the registry are our direct children.
                unsafe {
                    libc::kill(*pid as libc::pid_t, libc::SIGKILL);
                }
                #[cfg(not(unix))]
                let _ = pid;
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        if let Ok(still_open) = self.store.running_results() {
            for result in still_open {
                if let Err(e) =
                    self.store
                        .finalize_result(result.id, RunStatus::Failed, SHUTDOWN_MARKER, None)
                {
                    warn!(result_id = result.id, "shutdown finalize failed: {e}");
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runner::Runner;
    use std::io::Write;
    use taskwheel_store::{TaskDraft, TriggerType};

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

    fn event_draft(name: &str, event_type: EventType) -> TaskDraft {
        TaskDraft {
            name: name.to_string(),
            account: "tester".to_string(),
            trigger_type: TriggerType::Event,
            schedule_expression: None,
            event_type,
            condition_script: if event_type == EventType::Script {
                Some("true".to_string())
            } else {
                None
            },
            condition_interval: 60,
            is_active: true,
            pre_task_ids: Vec::new(),
            script_body: "echo lifecycle".to_string(),
        }
    }

    fn schedule_draft(name: &str) -> TaskDraft {
        TaskDraft {
            name: name.to_string(),
            account: "tester".to_string(),
            trigger_type: TriggerType::Schedule,
            schedule_expression: Some("*/5 * * * *".to_string()),
            event_type: EventType::Script,
            condition_script: None,
            condition_interval: 60,
            is_active: true,
            pre_task_ids: Vec::new(),
            script_body: "echo tick".to_string(),
        }
    }

    struct Harness {
        _guard: tempfile::TempDir,
        store: Arc<TaskStore>,
        dispatcher_task: JoinHandle<()>,
        shutdown_tx: watch::Sender<bool>,
    }

    fn start(config: RunnerConfig) -> Harness {
        let guard = tempfile::tempdir().unwrap();
        let accounts = fixture_accounts(&guard);
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let (handle, runner) = Runner::new(Arc::clone(&store), accounts.clone(), config.clone());
        tokio::spawn(runner.run());
        let dispatcher = Dispatcher::new(Arc::clone(&store), handle, accounts, config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx));
        Harness {
            _guard: guard,
            store,
            dispatcher_task,
            shutdown_tx,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, secs: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
        loop {
            if cond() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn boot_and_shutdown_tasks_fire_exactly_once() {
        let config = RunnerConfig {
            shutdown_grace_secs: 10,
            ..RunnerConfig::default()
        };
        // Lifecycle tasks must exist before the dispatcher starts.
        let guard = tempfile::tempdir().unwrap();
        let accounts = fixture_accounts(&guard);
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let boot = store
            .insert_task(event_draft("on-boot", EventType::SystemBoot))
            .unwrap();
        let stop = store
            .insert_task(event_draft("on-stop", EventType::SystemShutdown))
            .unwrap();

        let (handle, runner) = Runner::new(Arc::clone(&store), accounts.clone(), config.clone());
        tokio::spawn(runner.run());
        let dispatcher = Dispatcher::new(Arc::clone(&store), handle, accounts, config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx));

        let store2 = Arc::clone(&store);
        assert!(
            wait_until(move || store2.latest_success(boot.id).unwrap().is_some(), 10).await
        );
        let boot_results = store.list_results(boot.id, 10, 0).unwrap();
        assert_eq!(boot_results.len(), 1);
        assert_eq!(boot_results[0].trigger_reason, "event:boot");
        // The shutdown task has not fired yet.
        assert!(store.list_results(stop.id, 10, 0).unwrap().is_empty());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(15), dispatcher_task)
            .await
            .expect("dispatcher should stop within the grace period")
            .unwrap();

        let stop_results = store.list_results(stop.id, 10, 0).unwrap();
        assert_eq!(stop_results.len(), 1);
        assert_eq!(stop_results[0].trigger_reason, "event:shutdown");
        assert_eq!(stop_results[0].status, RunStatus::Success);
    }

    #[tokio::test]
    async fn due_schedule_task_fires_and_reschedules() {
        let harness = start(RunnerConfig::default());
        let task = harness.store.insert_task(schedule_draft("due-now")).unwrap();
        // Backdate the fire time so the next tick picks it up.
        harness
            .store
            .set_next_run(task.id, Some("2000-01-01 00:00:00"))
            .unwrap();

        let store2 = Arc::clone(&harness.store);
        assert!(
            wait_until(move || store2.latest_success(task.id).unwrap().is_some(), 10).await
        );
        let results = harness.store.list_results(task.id, 10, 0).unwrap();
        // Coalesced: one fire despite decades of missed windows.
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].trigger_reason, "cron");

        // next_run_at moved strictly past now.
        let refreshed = harness.store.get_task(task.id).unwrap().unwrap();
        assert!(refreshed.next_run_at.unwrap() > time::now_ts());

        harness.shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(10), harness.dispatcher_task).await;
    }

    #[tokio::test]
    async fn condition_poller_fires_on_zero_exit() {
        let harness = start(RunnerConfig::default());
        let mut probe_task = event_draft("watcher", EventType::Script);
        probe_task.condition_interval = 10; // floor; first probe is immediate
        let task = harness.store.insert_task(probe_task).unwrap();

        let store2 = Arc::clone(&harness.store);
        assert!(
            wait_until(move || store2.latest_success(task.id).unwrap().is_some(), 10).await
        );
        let results = harness.store.list_results(task.id, 10, 0).unwrap();
        assert_eq!(results[0].trigger_reason, "event:script");

        harness.shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(10), harness.dispatcher_task).await;
    }

    #[tokio::test]
    async fn malformed_stored_expression_goes_dormant() {
        // File-backed store so the test can corrupt the row under the
        // dispatcher, the way a hand-edited database would.
        let guard = tempfile::tempdir().unwrap();
        let db_path = guard.path().join("wheel.db");
        let db_path = db_path.to_str().unwrap();
        let accounts = fixture_accounts(&guard);
        let store = Arc::new(TaskStore::open(db_path).unwrap());
        let task = store.insert_task(schedule_draft("rotten")).unwrap();

        let raw = rusqlite::Connection::open(db_path).unwrap();
        raw.execute(
            "UPDATE tasks SET schedule_expression = 'not a cron line',
                              next_run_at = '2000-01-01 00:00:00'
             WHERE id = ?1",
            [task.id],
        )
        .unwrap();
        drop(raw);

        let config = RunnerConfig::default();
        let (handle, runner) = Runner::new(Arc::clone(&store), accounts.clone(), config.clone());
        tokio::spawn(runner.run());
        let dispatcher = Dispatcher::new(Arc::clone(&store), handle, accounts, config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx));

        let store2 = Arc::clone(&store);
        assert!(
            wait_until(
                move || {
                    store2
                        .get_task(task.id)
                        .unwrap()
                        .unwrap()
                        .next_run_at
                        .is_none()
                },
                10
            )
            .await
        );
        // Dormant: no run record was produced.
        assert!(store.list_results(task.id, 10, 0).unwrap().is_empty());

        shutdown_tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(10), dispatcher_task).await;
    }
}
