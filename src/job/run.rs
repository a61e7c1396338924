use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phases of a single run.
///
/// A run flows through: ADMITTING → VALIDATING → PREPARING → RUNNING →
/// CLEANUP and ends in SUCCEEDED or FAILED. Failures before PREPARING skip
/// straight to the terminal state since no workspace exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Admitting,
    Validating,
    Preparing,
    Running,
    Cleanup,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Admitting => write!(f, "ADMITTING"),
            RunState::Validating => write!(f, "VALIDATING"),
            RunState::Preparing => write!(f, "PREPARING"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Cleanup => write!(f, "CLEANUP"),
            RunState::Succeeded => write!(f, "SUCCEEDED"),
            RunState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Bookkeeping for one run, produced when the run reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub job: String,
    /// Counter assigned by the store. `None` when the run never passed validation.
    pub run_number: Option<u64>,
    pub state_transitions: Vec<RunState>,
    pub steps_total: usize,
    pub steps_run: usize,
    pub return_code: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
}

impl RunRecord {
    pub fn begin(job: &str) -> Self {
        Self {
            job: job.to_string(),
            run_number: None,
            state_transitions: vec![RunState::Admitting],
            steps_total: 0,
            steps_run: 0,
            return_code: 0,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state_transitions
            .last()
            .copied()
            .unwrap_or(RunState::Admitting)
    }

    /// Moves to `next`. Transitions out of a terminal state are ignored.
    pub fn enter(&mut self, next: RunState) {
        if self.state().is_terminal() {
            return;
        }
        self.state_transitions.push(next);
        if next.is_terminal() {
            let now = Utc::now();
            self.duration_ms = (now - self.started_at).num_milliseconds();
            self.completed_at = Some(now);
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state() == RunState::Succeeded
    }
}
