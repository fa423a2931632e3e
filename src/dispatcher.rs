//! Bounded-concurrency execution of a whole batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::aggregate::{BatchResult, ItemResult, aggregate};
use crate::cancel::CancelSignal;
use crate::error::EnhanceError;
use crate::orchestrator::ItemWorkflow;
use crate::state_machine::{FailureDetail, FailureReason, WorkItem};
use crate::step::StepKind;

/// Notified as the batch makes progress. Called from worker tasks.
pub trait ProgressReporter: Send + Sync {
    fn batch_started(&self, _total: usize) {}

    fn item_finished(&self, result: &ItemResult);

    fn batch_finished(&self, _batch: &BatchResult) {}
}

pub struct BatchDispatcher {
    workflow: Arc<ItemWorkflow>,
    reporter: Option<Arc<dyn ProgressReporter>>,
    cancel: CancelSignal,
}

impl BatchDispatcher {
    pub fn new(workflow: ItemWorkflow) -> Self {
        Self {
            workflow: Arc::new(workflow),
            reporter: None,
            cancel: CancelSignal::never(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn workflow(&self) -> &ItemWorkflow {
        &self.workflow
    }

    /// Run every item, at most `max_concurrency` at a time, and return once
    /// all of them are terminal. Items are admitted in input order and
    /// results come back in input order.
    pub async fn run(
        &self,
        items: Vec<WorkItem>,
        max_concurrency: usize,
    ) -> Result<BatchResult, EnhanceError> {
        if max_concurrency == 0 {
            return Err(EnhanceError::Config(
                "max concurrency must be at least 1".to_string(),
            ));
        }

        let started = Instant::now();
        info!(items = items.len(), max_concurrency, "starting batch");
        if let Some(reporter) = &self.reporter {
            reporter.batch_started(items.len());
        }

        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut handles = Vec::with_capacity(items.len());

        for item in &items {
            // Held until the workflow is terminal, backoff sleeps included.
            let permit = semaphore.clone().acquire_owned().await.map_err(|e| {
                EnhanceError::Dispatch(format!("failed to acquire admission permit: {e}"))
            })?;

            let workflow = Arc::clone(&self.workflow);
            let reporter = self.reporter.clone();
            let cancel = self.cancel.clone();
            let item = item.clone();
            handles.push(tokio::spawn(async move {
                let result = workflow.run(item, cancel).await;
                drop(permit);
                if let Some(reporter) = reporter {
                    reporter.item_finished(&result);
                }
                result
            }));
        }

        let joined = join_all(handles).await;
        let mut results = Vec::with_capacity(items.len());
        for (item, joined) in items.iter().zip(joined) {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(item = %item.id, error = %e, "workflow task failed");
                    let result = self.lost_task_result(item, e.to_string()).await;
                    if let Some(reporter) = &self.reporter {
                        reporter.item_finished(&result);
                    }
                    result
                }
            };
            results.push(result);
        }

        let batch = aggregate(results, started.elapsed());
        info!(
            total = batch.total,
            succeeded = batch.succeeded,
            failed = batch.failed,
            wall_ms = u64::try_from(batch.wall_time.as_millis()).unwrap_or(u64::MAX),
            "batch finished"
        );
        if let Some(reporter) = &self.reporter {
            reporter.batch_finished(&batch);
        }
        Ok(batch)
    }

    /// Failed result for a task that died without reporting, attributed to
    /// the step its journal last recorded.
    async fn lost_task_result(&self, item: &WorkItem, message: String) -> ItemResult {
        let recorded = self.workflow.recorded_state(&item.id).await.ok().flatten();
        let (step, attempts, elapsed) = match &recorded {
            Some(wf) => (
                wf.state.step().unwrap_or(StepKind::Fetch),
                wf.attempt,
                wf.elapsed,
            ),
            None => (StepKind::Fetch, 0, Duration::ZERO),
        };
        let failure = FailureDetail {
            step,
            reason: FailureReason::Aborted,
            attempts,
            message: format!("workflow task failed: {message}"),
        };
        ItemResult::failed(item, failure, elapsed)
    }
}
