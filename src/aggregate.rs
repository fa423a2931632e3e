//! Per-item terminal results and the batch summary built from them.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state_machine::{FailureDetail, ItemId, ItemStatus, WorkItem, WorkflowState};
use crate::step::StepKind;
use crate::storage::Location;

/// Terminal outcome of one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub item_id: ItemId,
    pub source: Location,
    pub destination: Location,
    pub status: ItemStatus,
    /// Time spent in steps plus retry delays.
    pub duration: Duration,
    pub step_attempts: BTreeMap<StepKind, u32>,
    pub failure: Option<FailureDetail>,
    pub cleanup_error: Option<String>,
}

impl ItemResult {
    pub fn from_state(wf: &WorkflowState, status: ItemStatus) -> Self {
        Self {
            item_id: wf.item.id,
            source: wf.item.source.clone(),
            destination: wf.item.destination.clone(),
            status,
            duration: wf.elapsed,
            step_attempts: wf.step_attempts.clone(),
            failure: wf.failure().cloned(),
            cleanup_error: wf.cleanup_error.clone(),
        }
    }

    /// A result for a workflow that never produced one of its own.
    pub fn failed(item: &WorkItem, failure: FailureDetail, duration: Duration) -> Self {
        Self {
            item_id: item.id,
            source: item.source.clone(),
            destination: item.destination.clone(),
            status: ItemStatus::Failed,
            duration,
            step_attempts: BTreeMap::new(),
            failure: Some(failure),
            cleanup_error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Per-item results in input order.
    pub items: Vec<ItemResult>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub wall_time: Duration,
    pub total_item_time: Duration,
    pub average_item_time: Duration,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemResult> {
        self.items.iter().filter(|r| !r.is_success())
    }
}

pub fn aggregate(results: Vec<ItemResult>, wall_time: Duration) -> BatchResult {
    let total = results.len();
    let succeeded = results.iter().filter(|r| r.is_success()).count();
    let total_item_time: Duration = results.iter().map(|r| r.duration).sum();
    let average_item_time = match u32::try_from(total) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total_item_time / n,
        Err(_) => Duration::from_secs_f64(total_item_time.as_secs_f64() / total as f64),
    };

    BatchResult {
        items: results,
        total,
        succeeded,
        failed: total - succeeded,
        wall_time,
        total_item_time,
        average_item_time,
    }
}
