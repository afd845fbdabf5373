use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 28256;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_DB_PATH: &str = "taskwheel.db";
/// Per-run wall-clock cap for task scripts.
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 900;
/// Wall-clock cap for condition probes.
pub const DEFAULT_CONDITION_TIMEOUT_SECS: u64 = 60;
/// Captured-log byte cap per run (256 KiB).
pub const DEFAULT_LOG_CAP_BYTES: usize = 256 * 1024;
/// How long shutdown waits for in-flight runs before force-killing them.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

/// Top-level config (`taskwheel.toml` + `TASKWHEEL_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskwheelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Path to the Basic Auth JSON file. Auth is enabled when the file exists
    /// and contains `"enabled": true`.
    #[serde(default)]
    pub auth_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// URL prefix both the UI and the API are mounted under.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Prefer the IPv6 wildcard / loopback when binding.
    #[serde(default)]
    pub prefer_ipv6: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_condition_timeout")]
    pub condition_timeout_secs: u64,
    #[serde(default = "default_log_cap")]
    pub log_cap_bytes: usize,
    /// Optional global cap on concurrently executing tasks. `None` means
    /// unbounded; per-task concurrency is always 1 regardless.
    #[serde(default)]
    pub max_parallel: Option<usize>,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            base_path: default_base_path(),
            prefer_ipv6: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout(),
            condition_timeout_secs: default_condition_timeout(),
            log_cap_bytes: default_log_cap(),
            max_parallel: None,
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_base_path() -> String {
    "/".to_string()
}
fn default_db_path() -> String {
    DEFAULT_DB_PATH.to_string()
}
fn default_task_timeout() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}
fn default_condition_timeout() -> u64 {
    DEFAULT_CONDITION_TIMEOUT_SECS
}
fn default_log_cap() -> usize {
    DEFAULT_LOG_CAP_BYTES
}
fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}

impl TaskwheelConfig {
    /// Load config from a TOML file with `TASKWHEEL_*` env var overrides.
    ///
    /// Nested keys use a double underscore in the environment, e.g.
    /// `TASKWHEEL_SERVER__PORT=8080` or `TASKWHEEL_RUNNER__TASK_TIMEOUT_SECS=60`.
    /// A missing file is fine — defaults apply.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("taskwheel.toml");

        let config: TaskwheelConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("TASKWHEEL_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

/// Collapse a user-supplied base path to a canonical `/`-rooted form with no
/// trailing slash (`""`, `"/"`, `"sched/"` → `"/"`, `"/"`, `"/sched"`).
pub fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return "/".to_string();
    }
    let mut base = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    };
    while base.len() > 1 && base.ends_with('/') {
        base.pop();
    }
    base
}

/// Map a configured host to the address actually bound when IPv6 is
/// preferred: the IPv4 wildcard becomes `::`, loopback becomes `::1`.
/// Anything else must already be a literal IPv6 address.
pub fn resolve_listen_host(host: &str, prefer_ipv6: bool) -> crate::error::Result<String> {
    if !prefer_ipv6 || host.contains(':') {
        return Ok(host.to_string());
    }
    let normalized = host.trim();
    if normalized.is_empty() || normalized == "0.0.0.0" {
        return Ok("::".to_string());
    }
    if normalized == "127.0.0.1" || normalized == "localhost" {
        return Ok("::1".to_string());
    }
    Err(crate::error::CoreError::Config(format!(
        "cannot map {normalized} to an IPv6 listen address; provide one explicitly (e.g. ::)"
    )))
}
