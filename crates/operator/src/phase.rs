//! Application lifecycle phases and the transition table that drives them.
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, JsonSchema, PartialEq, Eq)]
pub enum Phase { Building, Running, Failed, AuthError }

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { Phase::Building => "Building", Phase::Running => "Running", Phase::Failed => "Failed", Phase::AuthError => "AuthError" };
        f.write_str(s)
    }
}

/// Observations made during one control-loop step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Every credential strategy was rejected by the remote.
    AuthFailure,
    /// Remote unreachable or ref missing.
    ResolutionFailed,
    ResolutionSucceeded,
    /// A build task was submitted for a commit other than the last-built one.
    BuildSubmitted,
    /// The build task for the last-built commit exists and has no outcome yet.
    BuildPending,
    BuildSucceeded,
    BuildFailed,
    /// Ready replicas reached the desired count.
    WorkloadReady,
    /// Ready replicas below the desired count.
    WorkloadNotReady,
}

/// Exhaustive transition function. `None` is the initial, never-reconciled state.
pub fn transition(current: Option<Phase>, event: Event) -> Option<Phase> {
    use Event::*;
    use Phase::*;
    match (current, event) {
        (_, AuthFailure) => Some(AuthError),
        (Some(AuthError), ResolutionSucceeded) => Some(Running),
        (p, ResolutionSucceeded) => p,
        (Some(Building), ResolutionFailed) => Some(Failed),
        (p, ResolutionFailed) => p,
        (_, BuildSubmitted) | (_, BuildPending) | (_, BuildSucceeded) => Some(Building),
        (_, BuildFailed) => Some(Failed),
        (_, WorkloadReady) => Some(Running),
        (p, WorkloadNotReady) => p,
    }
}
