//! Run and stage lifecycle transition tables

use crate::types::{RunState, StageState};
use std::fmt::Debug;

/// Rejected lifecycle transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal {kind} transition: {from} -> {to}")]
pub struct TransitionError {
    /// "run" or "stage"
    pub kind: &'static str,
    /// Current state
    pub from: String,
    /// Requested state
    pub to: String,
}

/// States reachable from a run state
#[must_use]
pub fn run_transitions(from: RunState) -> &'static [RunState] {
    use RunState::*;
    match from {
        Init => &[Running, Aborted],
        Running => &[Success, Failed, Aborted],
        Success | Failed | Aborted => &[],
    }
}

/// States reachable from a stage state
#[must_use]
pub fn stage_transitions(from: StageState) -> &'static [StageState] {
    use StageState::*;
    match from {
        Pending => &[Running],
        Running => &[Done, Failed],
        // retry / resume re-enter Running
        Failed => &[Running, Skipped],
        Done | Skipped => &[],
    }
}

/// Validate a run transition
///
/// # Errors
/// Returns `TransitionError` if the table does not allow it.
pub fn validate_run_transition(from: RunState, to: RunState) -> Result<(), TransitionError> {
    check("run", from, to, run_transitions(from))
}

/// Validate a stage transition
///
/// # Errors
/// Returns `TransitionError` if the table does not allow it.
pub fn validate_stage_transition(from: StageState, to: StageState) -> Result<(), TransitionError> {
    check("stage", from, to, stage_transitions(from))
}

fn check<S: Copy + PartialEq + Debug>(
    kind: &'static str,
    from: S,
    to: S,
    allowed: &[S],
) -> Result<(), TransitionError> {
    if allowed.contains(&to) {
        Ok(())
    } else {
        Err(TransitionError {
            kind,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        })
    }
}
