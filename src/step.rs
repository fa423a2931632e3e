//! Execution of a single pipeline step against the collaborators.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::state_machine::{State, WorkItem, WorkflowState};
use crate::storage::{ArtifactSlot, Scratch, Storage, content_type_for};
use crate::transform::Transformer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Fetch,
    Transform,
    Store,
    Cleanup,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Fetch => write!(f, "fetch"),
            StepKind::Transform => write!(f, "transform"),
            StepKind::Store => write!(f, "store"),
            StepKind::Cleanup => write!(f, "cleanup"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// The result of one step attempt.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: StepKind,
    pub status: StepStatus,
    /// Scratch artifact produced by the step, if it produces one.
    pub artifact: Option<PathBuf>,
    pub error: Option<CollaboratorError>,
    pub attempt: u32,
    pub elapsed: Duration,
}

impl StepOutcome {
    pub fn success(
        step: StepKind,
        attempt: u32,
        artifact: Option<PathBuf>,
        elapsed: Duration,
    ) -> Self {
        Self {
            step,
            status: StepStatus::Success,
            artifact,
            error: None,
            attempt,
            elapsed,
        }
    }

    /// A failed attempt, classified by the error's kind.
    pub fn failure(step: StepKind, attempt: u32, error: CollaboratorError, elapsed: Duration) -> Self {
        let status = if error.is_retryable() {
            StepStatus::RetryableFailure
        } else {
            StepStatus::FatalFailure
        };
        Self {
            step,
            status,
            artifact: None,
            error: Some(error),
            attempt,
            elapsed,
        }
    }

    pub fn detail(&self) -> String {
        match &self.error {
            Some(err) => err.to_string(),
            None => "ok".to_string(),
        }
    }
}

/// The external systems steps talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub transformer: Arc<dyn Transformer>,
    pub scratch: Arc<dyn Scratch>,
}

/// Hard deadline for each step kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepTimeouts {
    pub fetch: Duration,
    pub transform: Duration,
    pub store: Duration,
    pub cleanup: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(5 * 60),
            transform: Duration::from_secs(10 * 60),
            store: Duration::from_secs(5 * 60),
            cleanup: Duration::from_secs(60),
        }
    }
}

impl StepTimeouts {
    pub fn for_step(&self, step: StepKind) -> Duration {
        match step {
            StepKind::Fetch => self.fetch,
            StepKind::Transform => self.transform,
            StepKind::Store => self.store,
            StepKind::Cleanup => self.cleanup,
        }
    }
}

/// Everything a step attempt reads: the item and the artifacts earlier
/// steps left behind.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    pub item: &'a WorkItem,
    pub attempt: u32,
    pub fetched: Option<&'a Path>,
    pub transformed: Option<&'a Path>,
}

impl<'a> From<&'a WorkflowState> for StepInput<'a> {
    fn from(wf: &'a WorkflowState) -> Self {
        Self {
            item: &wf.item,
            attempt: wf.attempt,
            fetched: wf.fetched.as_deref(),
            transformed: wf.transformed.as_deref(),
        }
    }
}

/// Runs steps under a deadline and classifies what happened. Never touches
/// workflow state.
pub struct StepExecutor {
    collaborators: Collaborators,
}

impl StepExecutor {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    pub async fn execute(
        &self,
        step: StepKind,
        input: &StepInput<'_>,
        timeout: Duration,
    ) -> StepOutcome {
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.invoke(step, input)).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::timeout(format!(
                "{step} step exceeded its {}ms deadline",
                timeout.as_millis()
            ))),
        };
        let elapsed = started.elapsed();

        match result {
            Ok(artifact) => StepOutcome::success(step, input.attempt, artifact, elapsed),
            Err(err) => StepOutcome::failure(step, input.attempt, err, elapsed),
        }
    }

    /// The earliest artifact the current state depends on that the scratch
    /// space no longer holds.
    pub async fn missing_artifact(&self, wf: &WorkflowState) -> Option<ArtifactSlot> {
        let needs_transformed = match wf.state {
            State::Transforming => false,
            State::Storing => true,
            _ => return None,
        };
        if needs_transformed && self.holds(wf.transformed.as_deref()).await {
            return None;
        }
        if !self.holds(wf.fetched.as_deref()).await {
            return Some(ArtifactSlot::Fetched);
        }
        needs_transformed.then_some(ArtifactSlot::Transformed)
    }

    async fn holds(&self, artifact: Option<&Path>) -> bool {
        match artifact {
            Some(path) => self.collaborators.scratch.contains(path).await,
            None => false,
        }
    }

    async fn invoke(
        &self,
        step: StepKind,
        input: &StepInput<'_>,
    ) -> Result<Option<PathBuf>, CollaboratorError> {
        let Collaborators {
            storage,
            transformer,
            scratch,
        } = &self.collaborators;
        let item = input.item;

        match step {
            StepKind::Fetch => {
                let bytes = storage.read(&item.source).await?;
                let artifact = scratch.park(&item.id, ArtifactSlot::Fetched, bytes).await?;
                Ok(Some(artifact))
            }
            StepKind::Transform => {
                let fetched = required(input.fetched, ArtifactSlot::Fetched)?;
                let bytes = scratch.load(fetched).await?;
                let transformed = transformer.transform(bytes, &item.directive).await?;
                let artifact = scratch
                    .park(&item.id, ArtifactSlot::Transformed, transformed)
                    .await?;
                Ok(Some(artifact))
            }
            StepKind::Store => {
                let transformed = required(input.transformed, ArtifactSlot::Transformed)?;
                let bytes = scratch.load(transformed).await?;
                let content_type = content_type_for(&item.destination.key);
                storage.write(&item.destination, bytes, content_type).await?;
                Ok(None)
            }
            StepKind::Cleanup => {
                scratch.release(&item.id).await?;
                Ok(None)
            }
        }
    }
}

fn required(artifact: Option<&Path>, slot: ArtifactSlot) -> Result<&Path, CollaboratorError> {
    artifact.ok_or_else(|| CollaboratorError::not_found(format!("no {slot:?} artifact recorded")))
}
