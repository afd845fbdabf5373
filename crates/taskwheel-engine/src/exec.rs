//! Script execution: spawn, log capture, timeout enforcement.
//!
//! Output handling streams both pipes into one byte-capped buffer. Reading
//! continues past the cap (counting omitted bytes) so the child never blocks
//! on a full pipe; the cap only limits what is stored.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use taskwheel_store::RunStatus;

use crate::account::Privileges;

/// Live child processes by result id, kept so shutdown can force-terminate
/// whatever outlives the grace period.
pub type PidRegistry = DashMap<i64, u32>;

/// How long a timed-out child gets between the terminate signal and the kill.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Terminal outcome of one script execution. Failures (spawn errors,
/// permission problems, timeouts) are encoded here, never raised.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub log: String,
}

impl ExecOutcome {
    pub fn failed(log: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            exit_code: None,
            log: log.into(),
        }
    }
}

/// Everything the executor needs besides the script text.
pub struct ExecContext {
    pub timeout: Duration,
    pub log_cap: usize,
    pub env: Vec<(String, String)>,
    pub privileges: Privileges,
    /// Registry slot to occupy while the child runs (`result_id` keyed).
    pub registry: Option<(Arc<PidRegistry>, i64)>,
}

/// Byte-capped sink for merged child output.
///
/// Bytes past the cap are counted, not stored; [`CapturedLog::render`]
/// appends an explicit truncation marker when anything was dropped.
pub struct CapturedLog {
    bytes: Vec<u8>,
    cap: usize,
    omitted: usize,
}

impl CapturedLog {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            cap,
            omitted: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.cap.saturating_sub(self.bytes.len());
        if room >= chunk.len() {
            self.bytes.extend_from_slice(chunk);
        } else {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.omitted += chunk.len() - room;
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.omitted > 0 {
            out.push_str(&format!(
                "\n... [log truncated, {} bytes omitted]",
                self.omitted
            ));
        }
        out
    }
}

/// Build the platform shell invocation for a script body.
pub fn build_command(script: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c").arg(script);
        cmd
    }
    #[cfg(not(unix))]
    {
        let mut cmd = Command::new("powershell");
        cmd.args(["-NoLogo", "-NonInteractive", "-ExecutionPolicy", "Bypass", "-Command"])
            .arg(script);
        cmd
    }
}

/// Run `script` to completion under `ctx`, returning the captured outcome.
pub async fn run_script(script: &str, ctx: ExecContext) -> ExecOutcome {
    let mut cmd = build_command(script);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &ctx.env {
        cmd.env(key, value);
    }

    match &ctx.privileges {
        Privileges::Inherit { home } => {
            if let Some(home) = home {
                cmd.env("HOME", home);
            }
        }
        Privileges::Drop {
            uid,
            gid,
            groups,
            home,
        } => {
            cmd.env("HOME", home);
            apply_identity(&mut cmd, *uid, *gid, groups.clone());
        }
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ExecOutcome::failed(format!("failed to spawn script: {e}")),
    };

    let pid = child.id();
    if let (Some((registry, result_id)), Some(pid)) = (&ctx.registry, pid) {
        registry.insert(*result_id, pid);
    }

    let log = Arc::new(Mutex::new(CapturedLog::new(ctx.log_cap)));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(drain(stdout, Arc::clone(&log))));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(drain(stderr, Arc::clone(&log))));
    }

    let outcome = match tokio::time::timeout(ctx.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            for reader in readers {
                let _ = reader.await;
            }
            let exit_code = status.code();
            let log = log.lock().unwrap().render();
            ExecOutcome {
                status: if exit_code == Some(0) {
                    RunStatus::Success
                } else {
                    RunStatus::Failed
                },
                exit_code,
                log,
            }
        }
        Ok(Err(e)) => {
            warn!("wait on child failed: {e}");
            for reader in readers {
                reader.abort();
            }
            ExecOutcome::failed(format!("failed waiting on script: {e}"))
        }
        Err(_elapsed) => {
            terminate(&mut child, pid).await;
            for reader in readers {
                let _ = reader.await;
            }
            let mut rendered = log.lock().unwrap().render();
            if !rendered.is_empty() {
                rendered.push('\n');
            }
            rendered.push_str(&timeout_marker(ctx.timeout));
            ExecOutcome {
                status: RunStatus::Failed,
                exit_code: None,
                log: rendered,
            }
        }
    };

    if let Some((registry, result_id)) = &ctx.registry {
        registry.remove(result_id);
    }
    outcome
}

/// Marker appended to the log of a timed-out run.
pub fn timeout_marker(timeout: Duration) -> String {
    format!("[task timed out after {}s, killed]", timeout.as_secs())
}

async fn drain(mut pipe: impl AsyncRead + Unpin, log: Arc<Mutex<CapturedLog>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => log.lock().unwrap().push(&chunk[..n]),
        }
    }
}

/// Terminate politely first, then force-kill if the child lingers.
async fn terminate(child: &mut tokio::process::Child, pid: Option<u32>) {
    debug!(?pid, "terminating timed-out child");
    #[cfg(unix)]
    if let Some(pid) = pid {
        // Safety: pid is our direct child, still reaped by `child`.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

/// Install setgroups/setgid/setuid in the child's pre-exec hook.
#[cfg(unix)]
fn apply_identity(cmd: &mut Command, uid: u32, gid: u32, groups: Vec<u32>) {
    let gids: Vec<libc::gid_t> = groups.iter().map(|g| *g as libc::gid_t).collect();
    // Safety: the hook runs post-fork pre-exec and only calls async-signal-safe
    // syscalls. Order matters — groups before the uid drop.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setgroups(gids.len(), gids.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setgid(gid as libc::gid_t) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setuid(uid as libc::uid_t) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_identity(_cmd: &mut Command, _uid: u32, _gid: u32, _groups: Vec<u32>) {}
