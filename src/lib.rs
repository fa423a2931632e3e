//! Durable, bounded-concurrency batch orchestration of a
//! fetch → transform → store → cleanup pipeline.
//!
//! Each work item runs as an [`ItemWorkflow`]: a state machine that journals
//! every transition, retries transient step failures with backoff and always
//! releases its scratch artifacts. The [`BatchDispatcher`] runs many
//! workflows under a concurrency ceiling and folds their results into a
//! [`BatchResult`].

pub mod aggregate;
pub mod batch;
pub mod cancel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod journal;
pub mod logging;
pub mod orchestrator;
pub mod retry;
pub mod state_machine;
pub mod step;
pub mod storage;
pub mod transform;
pub mod ui;

#[cfg(test)]
mod testing;

pub use aggregate::{BatchResult, ItemResult, aggregate};
pub use batch::BatchInput;
pub use cancel::{CancelHandle, CancelSignal, cancellation};
pub use config::EnhanceConfig;
pub use dispatcher::{BatchDispatcher, ProgressReporter};
pub use error::{CollaboratorError, EnhanceError, ErrorKind, JournalError};
pub use journal::{FileJournal, Journal, MemoryJournal};
pub use orchestrator::{ItemWorkflow, StepPolicies};
pub use retry::RetryPolicy;
pub use state_machine::{ItemId, ItemStatus, State, WorkItem, WorkflowState};
pub use step::{Collaborators, StepExecutor, StepKind, StepTimeouts};
pub use storage::{LocalScratch, LocalStorage, Location, Scratch, Storage};
pub use transform::{HttpTransformer, Transformer};
