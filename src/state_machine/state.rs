use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::item::{FailureDetail, FailureReason, ItemStatus, Verdict, WorkflowState};
use crate::retry::{self, RetryDecision, RetryPolicy};
use crate::step::{StepKind, StepOutcome, StepStatus};
use crate::storage::ArtifactSlot;

/// The states of the per-item workflow.
///
/// Each item flows through: PENDING → FETCHING → TRANSFORMING → STORING →
/// CLEANING_UP → COMPLETED, or leaves any step state early for CLEANING_UP
/// and ends in FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Pending,
    Fetching,
    Transforming,
    Storing,
    CleaningUp,
    Completed,
    Failed,
}

impl State {
    /// The step executed while in this state.
    pub fn step(self) -> Option<StepKind> {
        match self {
            State::Fetching => Some(StepKind::Fetch),
            State::Transforming => Some(StepKind::Transform),
            State::Storing => Some(StepKind::Store),
            State::CleaningUp => Some(StepKind::Cleanup),
            State::Pending | State::Completed | State::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Pending => write!(f, "PENDING"),
            State::Fetching => write!(f, "FETCHING"),
            State::Transforming => write!(f, "TRANSFORMING"),
            State::Storing => write!(f, "STORING"),
            State::CleaningUp => write!(f, "CLEANING_UP"),
            State::Completed => write!(f, "COMPLETED"),
            State::Failed => write!(f, "FAILED"),
        }
    }
}

/// A state change of one workflow. Transitions are journaled before they are
/// applied, so replaying them rebuilds the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transition {
    /// The step succeeded; move on to `to`.
    Advance {
        to: State,
        artifact: Option<PathBuf>,
        elapsed: Duration,
    },
    /// The step failed transiently; run it again after `delay`.
    Retry {
        state: State,
        delay: Duration,
        reason: String,
        elapsed: Duration,
    },
    /// A recorded intermediate artifact is gone; run the step that produced
    /// it again.
    Rewind { to: State, reason: String },
    /// The verdict is known; release resources next.
    Cleanup { verdict: Verdict, elapsed: Duration },
    /// Cleanup has run; the workflow is finished.
    Complete {
        status: ItemStatus,
        cleanup_error: Option<String>,
        elapsed: Duration,
    },
}

/// Decides how a workflow moves between states.
pub struct StateMachine;

impl StateMachine {
    /// Leave `Pending` for the first step.
    pub fn start() -> Transition {
        Transition::Advance {
            to: State::Fetching,
            artifact: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Compute the transition that follows one attempt of the current step.
    ///
    /// - Success in `Fetching` and `Transforming` advances to the next step;
    ///   success in `Storing` enters cleanup with a successful verdict.
    /// - Failure asks the retry policy: a retry keeps the state, giving up
    ///   enters cleanup with a failed verdict.
    pub fn next(wf: &WorkflowState, outcome: &StepOutcome, policy: &RetryPolicy) -> Transition {
        let elapsed = outcome.elapsed;

        if outcome.status == StepStatus::Success {
            return match wf.state {
                State::Fetching => Transition::Advance {
                    to: State::Transforming,
                    artifact: outcome.artifact.clone(),
                    elapsed,
                },
                State::Transforming => Transition::Advance {
                    to: State::Storing,
                    artifact: outcome.artifact.clone(),
                    elapsed,
                },
                State::Storing => Transition::Cleanup {
                    verdict: Verdict::Succeeded,
                    elapsed,
                },
                other => Self::abort(wf, format!("step outcome received in state {other}")),
            };
        }

        let message = outcome.detail();
        match retry::decide(policy, outcome, wf.attempt) {
            RetryDecision::Retry(delay) => Transition::Retry {
                state: wf.state,
                delay,
                reason: message,
                elapsed,
            },
            RetryDecision::GiveUp { exhausted } => Transition::Cleanup {
                verdict: Verdict::Failed(FailureDetail {
                    step: outcome.step,
                    reason: if exhausted {
                        FailureReason::RetryExhausted
                    } else {
                        FailureReason::Fatal
                    },
                    attempts: wf.attempt,
                    message,
                }),
                elapsed,
            },
        }
    }

    /// Go back to the step that produces `missing`.
    pub fn rewind(missing: ArtifactSlot, reason: String) -> Transition {
        let to = match missing {
            ArtifactSlot::Fetched => State::Fetching,
            ArtifactSlot::Transformed => State::Transforming,
        };
        Transition::Rewind { to, reason }
    }

    /// The batch was cancelled; skip remaining steps.
    pub fn cancel(wf: &WorkflowState) -> Transition {
        Transition::Cleanup {
            verdict: Verdict::Failed(FailureDetail {
                step: wf.state.step().unwrap_or(StepKind::Fetch),
                reason: FailureReason::Cancelled,
                attempts: wf.attempt,
                message: "batch cancelled".to_string(),
            }),
            elapsed: Duration::ZERO,
        }
    }

    /// Something outside the step contract broke (panic, journal failure).
    pub fn abort(wf: &WorkflowState, message: String) -> Transition {
        Transition::Cleanup {
            verdict: Verdict::Failed(FailureDetail {
                step: wf.state.step().unwrap_or(StepKind::Fetch),
                reason: FailureReason::Aborted,
                attempts: wf.attempt,
                message,
            }),
            elapsed: Duration::ZERO,
        }
    }

    /// Close the workflow after its single cleanup attempt. The verdict set on
    /// entering cleanup decides the terminal state; a cleanup failure is only
    /// recorded.
    pub fn finish(wf: &WorkflowState, cleanup: &StepOutcome) -> Transition {
        let status = match wf.verdict {
            Some(Verdict::Succeeded) => ItemStatus::Completed,
            _ => ItemStatus::Failed,
        };
        let cleanup_error = match cleanup.status {
            StepStatus::Success => None,
            _ => Some(cleanup.detail()),
        };
        Transition::Complete {
            status,
            cleanup_error,
            elapsed: cleanup.elapsed,
        }
    }
}
