use serde::{Deserialize, Serialize};

/// How a task is triggered: by the cron schedule or by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Schedule,
    Event,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggerType::Schedule => "schedule",
            TriggerType::Event => "event",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "schedule" => Ok(TriggerType::Schedule),
            "event" => Ok(TriggerType::Event),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// Event source for `trigger_type = event` tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A periodic condition probe; exit code 0 fires the task.
    Script,
    /// Fired once when the scheduler process starts.
    SystemBoot,
    /// Fired once when the scheduler process shuts down.
    SystemShutdown,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Script => "script",
            EventType::SystemBoot => "system_boot",
            EventType::SystemShutdown => "system_shutdown",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "script" => Ok(EventType::Script),
            "system_boot" => Ok(EventType::SystemBoot),
            "system_shutdown" => Ok(EventType::SystemShutdown),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

/// Lifecycle state of one execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// A persisted task definition.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    /// OS principal the script runs under. Group membership is re-checked at
    /// execution time, not here.
    pub account: String,
    pub trigger_type: TriggerType,
    /// Present iff `trigger_type = schedule`.
    pub schedule_expression: Option<String>,
    pub event_type: EventType,
    /// Present iff `event_type = script`.
    pub condition_script: Option<String>,
    /// Probe cadence in seconds; floored to 10 at write time.
    pub condition_interval: u32,
    pub is_active: bool,
    /// Prerequisite task ids — deduped, never contains this task's own id.
    pub pre_task_ids: Vec<i64>,
    pub script_body: String,
    pub last_run_at: Option<String>,
    pub last_status: Option<RunStatus>,
    /// Maintained only while `is_active` and scheduled; otherwise NULL.
    pub next_run_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A persisted execution record.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub id: i64,
    pub task_id: i64,
    pub status: RunStatus,
    pub trigger_reason: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub log: Option<String>,
    pub exit_code: Option<i32>,
}

/// Creation payload. Field defaults mirror the API contract: tasks default to
/// active schedule tasks with a 60-second probe interval.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    #[serde(default)]
    pub account: String,
    #[serde(default = "default_trigger_type")]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub schedule_expression: Option<String>,
    #[serde(default = "default_event_type")]
    pub event_type: EventType,
    #[serde(default)]
    pub condition_script: Option<String>,
    #[serde(default = "default_condition_interval")]
    pub condition_interval: u32,
    #[serde(default = "default_is_active")]
    pub is_active: bool,
    #[serde(default)]
    pub pre_task_ids: Vec<i64>,
    pub script_body: String,
}

/// Partial update payload; `None` keeps the existing value. Fields made
/// irrelevant by a trigger or event type change are cleared during
/// canonicalization regardless.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub account: Option<String>,
    pub trigger_type: Option<TriggerType>,
    pub schedule_expression: Option<String>,
    pub event_type: Option<EventType>,
    pub condition_script: Option<String>,
    pub condition_interval: Option<u32>,
    pub is_active: Option<bool>,
    pub pre_task_ids: Option<Vec<i64>>,
    pub script_body: Option<String>,
}

fn default_trigger_type() -> TriggerType {
    TriggerType::Schedule
}
fn default_event_type() -> EventType {
    EventType::Script
}
fn default_condition_interval() -> u32 {
    60
}
fn default_is_active() -> bool {
    true
}
