use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{State, Transition};
use crate::aggregate::ItemResult;
use crate::step::StepKind;
use crate::storage::Location;

/// Stable identifier of a work item.
///
/// Derived from the source and destination so the same batch maps onto the
/// same journals when it is run again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn derive(source: impl fmt::Display, destination: impl fmt::Display) -> Self {
        let name = format!("{source} -> {destination}");
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One unit of a batch: a source to transform and a destination to store to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub source: Location,
    pub destination: Location,
    pub directive: String,
}

impl WorkItem {
    pub fn new(source: Location, destination: Location, directive: impl Into<String>) -> Self {
        Self {
            id: ItemId::derive(&source, &destination),
            source,
            destination,
            directive: directive.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    Completed,
    Failed,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Completed => write!(f, "completed"),
            ItemStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Why a step ended the workflow early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Permanent collaborator error, never retried.
    Fatal,
    /// A transient error that hit the attempt ceiling.
    RetryExhausted,
    Cancelled,
    /// The workflow itself broke (panic, journal write failure).
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub step: StepKind,
    pub reason: FailureReason,
    pub attempts: u32,
    pub message: String,
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = self.step;
        match self.reason {
            FailureReason::Fatal => write!(f, "{step} step failed: {}", self.message),
            FailureReason::RetryExhausted => write!(
                f,
                "{step} step failed after {} attempts: {}",
                self.attempts, self.message
            ),
            FailureReason::Cancelled => write!(f, "cancelled before {step} step"),
            FailureReason::Aborted => {
                write!(f, "workflow aborted during {step} step: {}", self.message)
            }
        }
    }
}

/// The outcome decided before cleanup runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Succeeded,
    Failed(FailureDetail),
}

/// Progress of one item through the pipeline.
///
/// Only [`WorkflowState::apply`] mutates it, both when running live and when
/// replaying a journal.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub item: WorkItem,
    pub state: State,
    /// Attempt number of the current step, starting at 1.
    pub attempt: u32,
    pub elapsed: Duration,
    /// Attempts used by each step that has finished (successfully or not).
    pub step_attempts: BTreeMap<StepKind, u32>,
    pub fetched: Option<PathBuf>,
    pub transformed: Option<PathBuf>,
    pub verdict: Option<Verdict>,
    pub cleanup_error: Option<String>,
    pub result: Option<ItemResult>,
}

impl WorkflowState {
    pub fn new(item: WorkItem) -> Self {
        Self {
            item,
            state: State::Pending,
            attempt: 0,
            elapsed: Duration::ZERO,
            step_attempts: BTreeMap::new(),
            fetched: None,
            transformed: None,
            verdict: None,
            cleanup_error: None,
            result: None,
        }
    }

    pub fn apply(&mut self, transition: &Transition) {
        match transition {
            Transition::Advance {
                to,
                artifact,
                elapsed,
            } => {
                self.close_step();
                match self.state {
                    State::Fetching => self.fetched = artifact.clone(),
                    State::Transforming => self.transformed = artifact.clone(),
                    _ => {}
                }
                self.elapsed += *elapsed;
                self.state = *to;
                self.attempt = 1;
            }
            Transition::Retry { delay, elapsed, .. } => {
                self.close_step();
                self.elapsed += *elapsed + *delay;
                self.attempt += 1;
            }
            Transition::Rewind { to, .. } => {
                if *to == State::Fetching {
                    self.fetched = None;
                }
                self.transformed = None;
                self.state = *to;
                self.attempt = 1;
            }
            Transition::Cleanup { verdict, elapsed } => {
                self.close_step();
                self.elapsed += *elapsed;
                self.verdict = Some(verdict.clone());
                self.state = State::CleaningUp;
                self.attempt = 1;
            }
            Transition::Complete {
                status,
                cleanup_error,
                elapsed,
            } => {
                self.close_step();
                self.elapsed += *elapsed;
                self.cleanup_error = cleanup_error.clone();
                self.state = match status {
                    ItemStatus::Completed => State::Completed,
                    ItemStatus::Failed => State::Failed,
                };
                self.result = Some(ItemResult::from_state(self, *status));
            }
        }
    }

    /// Record the attempts spent in the current step, if any ran.
    fn close_step(&mut self) {
        if let Some(step) = self.state.step() {
            if self.attempt > 0 {
                self.step_attempts.insert(step, self.attempt);
            }
        }
    }

    pub fn failure(&self) -> Option<&FailureDetail> {
        match &self.verdict {
            Some(Verdict::Failed(detail)) => Some(detail),
            _ => None,
        }
    }
}
