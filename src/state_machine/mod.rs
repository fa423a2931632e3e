mod item;
mod state;

pub use item::{FailureDetail, FailureReason, ItemId, ItemStatus, Verdict, WorkItem, WorkflowState};
pub use state::{State, StateMachine, Transition};
