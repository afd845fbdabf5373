//! Fire-requests: the messages that ask the runner to execute a task once.

/// Why a task was asked to run. Rendered into the result row's
/// `trigger_reason` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireReason {
    /// The cron schedule came due.
    Cron,
    /// An operator requested the run via the API.
    Manual,
    /// A condition probe exited 0.
    ConditionMet,
    /// Process startup (`system_boot` event tasks).
    Boot,
    /// Process shutdown (`system_shutdown` event tasks).
    Shutdown,
    /// A prerequisite task finished successfully.
    Prerequisite(i64),
}

impl std::fmt::Display for FireReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FireReason::Cron => write!(f, "cron"),
            FireReason::Manual => write!(f, "manual"),
            FireReason::ConditionMet => write!(f, "event:script"),
            FireReason::Boot => write!(f, "event:boot"),
            FireReason::Shutdown => write!(f, "event:shutdown"),
            FireReason::Prerequisite(id) => write!(f, "prerequisite:{id}"),
        }
    }
}

/// Admission verdict for one fire-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// The run was admitted; a `running` result row with this id is open.
    Queued { result_id: i64 },
    /// Dropped: the task already has a run in flight.
    AlreadyRunning,
    /// Dropped: these prerequisites have never succeeded. No record written.
    Blocked { unmet: Vec<i64> },
    /// No task with the requested id.
    NotFound,
}
