//! Worker lifecycle states, published for observers.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Started, not yet polling.
    Idle,
    /// Looking for a task to claim.
    Polling,
    /// Holds a claim, validating parameters.
    Claimed,
    /// Work function running.
    Executing,
    /// Writing the outcome back.
    Reporting,
    /// Sleeping after an empty poll or a store error.
    Backoff,
    /// Draining; no further claims.
    ShuttingDown,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Polling => "polling",
            WorkerState::Claimed => "claimed",
            WorkerState::Executing => "executing",
            WorkerState::Reporting => "reporting",
            WorkerState::Backoff => "backoff",
            WorkerState::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
