use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::aggregate::ItemResult;
use crate::cancel::CancelSignal;
use crate::error::{CollaboratorError, JournalError};
use crate::journal::{self, Journal, JournalEntry};
use crate::retry::RetryPolicy;
use crate::state_machine::{ItemId, ItemStatus, State, StateMachine, Transition, WorkItem, WorkflowState};
use crate::step::{StepExecutor, StepInput, StepKind, StepOutcome, StepTimeouts};

/// Retry policies for the retried steps. Cleanup always runs once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepPolicies {
    pub fetch: RetryPolicy,
    pub transform: RetryPolicy,
    pub store: RetryPolicy,
}

impl StepPolicies {
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            fetch: policy.clone(),
            transform: policy.clone(),
            store: policy,
        }
    }

    fn for_step(&self, step: StepKind) -> Option<&RetryPolicy> {
        match step {
            StepKind::Fetch => Some(&self.fetch),
            StepKind::Transform => Some(&self.transform),
            StepKind::Store => Some(&self.store),
            StepKind::Cleanup => None,
        }
    }
}

/// Drives one work item through fetch, transform, store and cleanup.
///
/// Every transition is journaled before it takes effect. The step loop runs
/// inside a panic-catching scope and cleanup runs after it no matter how the
/// loop ended.
pub struct ItemWorkflow {
    executor: StepExecutor,
    policies: StepPolicies,
    timeouts: StepTimeouts,
    journal: Arc<dyn Journal>,
}

impl ItemWorkflow {
    pub fn new(
        executor: StepExecutor,
        policies: StepPolicies,
        timeouts: StepTimeouts,
        journal: Arc<dyn Journal>,
    ) -> Self {
        Self {
            executor,
            policies,
            timeouts,
            journal,
        }
    }

    /// The state rebuilt from `item`'s journal, if it has one.
    pub async fn recorded_state(&self, item: &ItemId) -> Result<Option<WorkflowState>, JournalError> {
        let entries = self.journal.replay(item).await?;
        journal::recover(item, &entries)
    }

    /// Run `item` to a terminal result, resuming from its journal when an
    /// interrupted run of the same item left one behind.
    pub async fn run(&self, item: WorkItem, mut cancel: CancelSignal) -> ItemResult {
        let resumed = self.resume_or_admit(&item).await;
        let mut wf = match resumed {
            Ok(wf) => wf,
            Err(err) => {
                error!(item = %item.id, error = %err, "journal unavailable");
                let mut wf = WorkflowState::new(item);
                let t = StateMachine::abort(&wf, format!("journal unavailable: {err}"));
                wf.apply(&t);
                wf
            }
        };

        if wf.state != State::CleaningUp {
            let driven = AssertUnwindSafe(self.drive(&mut wf, &mut cancel))
                .catch_unwind()
                .await;
            let aborted = match driven {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(format!("journal write failed: {err}")),
                Err(panic) => Some(format!("panicked: {}", panic_message(&*panic))),
            };
            if let Some(message) = aborted {
                error!(item = %wf.item.id, state = %wf.state, reason = %message, "workflow aborted");
                let t = StateMachine::abort(&wf, message);
                self.record_best_effort(&mut wf, t).await;
            }
        }

        self.clean_up(&mut wf).await;
        finished(wf)
    }

    /// Only an unfinished journal of an identical item is resumed. A finished
    /// run, or one admitted with another directive, is discarded.
    async fn resume_or_admit(&self, item: &WorkItem) -> Result<WorkflowState, JournalError> {
        if let Some(wf) = self.recorded_state(&item.id).await? {
            if !wf.state.is_terminal() && wf.item == *item {
                info!(item = %item.id, state = %wf.state, attempt = wf.attempt, "resuming from journal");
                return Ok(wf);
            }
            info!(item = %item.id, previous = %wf.state, "discarding previous run");
            if !wf.state.is_terminal() {
                self.release_stale(&wf).await;
            }
            self.journal.discard(&item.id).await?;
        }
        self.journal
            .append(&item.id, &JournalEntry::admitted(item.clone()))
            .await?;
        debug!(item = %item.id, source = %item.source, "admitted");
        Ok(WorkflowState::new(item.clone()))
    }

    /// Step loop. Returns once the workflow has entered `CleaningUp`.
    async fn drive(
        &self,
        wf: &mut WorkflowState,
        cancel: &mut CancelSignal,
    ) -> Result<(), JournalError> {
        if wf.state == State::Pending {
            self.record(wf, StateMachine::start()).await?;
        }
        if let Some(missing) = self.executor.missing_artifact(wf).await {
            let reason = format!("{missing:?} artifact is gone");
            warn!(item = %wf.item.id, state = %wf.state, reason = %reason, "rewinding");
            self.record(wf, StateMachine::rewind(missing, reason)).await?;
        }

        loop {
            let Some(step) = wf.state.step() else {
                return Ok(());
            };
            let Some(policy) = self.policies.for_step(step) else {
                return Ok(());
            };

            if cancel.is_cancelled() {
                info!(item = %wf.item.id, step = %step, "cancelled");
                let t = StateMachine::cancel(wf);
                return self.record(wf, t).await;
            }

            debug!(item = %wf.item.id, step = %step, attempt = wf.attempt, "running step");
            let input = StepInput::from(&*wf);
            let outcome = self
                .executor
                .execute(step, &input, self.timeouts.for_step(step))
                .await;

            let t = StateMachine::next(wf, &outcome, policy);
            let delay = match &t {
                Transition::Retry { delay, reason, .. } => {
                    warn!(
                        item = %wf.item.id,
                        step = %step,
                        attempt = wf.attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason = %reason,
                        "retrying step"
                    );
                    Some(*delay)
                }
                Transition::Cleanup { .. } if outcome.error.is_some() => {
                    warn!(item = %wf.item.id, step = %step, error = %outcome.detail(), "giving up on step");
                    None
                }
                _ => None,
            };
            self.record(wf, t).await?;

            if let Some(delay) = delay {
                // Cancellation during the wait is picked up at the top of the loop.
                cancel.sleep(delay).await;
            }
        }
    }

    /// Run cleanup once and finish the workflow.
    async fn clean_up(&self, wf: &mut WorkflowState) {
        let input = StepInput::from(&*wf);
        let cleanup = AssertUnwindSafe(self.executor.execute(
            StepKind::Cleanup,
            &input,
            self.timeouts.cleanup,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            StepOutcome::failure(
                StepKind::Cleanup,
                1,
                CollaboratorError::internal(format!("panicked: {}", panic_message(&*panic))),
                Duration::ZERO,
            )
        });

        if let Some(err) = &cleanup.error {
            warn!(item = %wf.item.id, error = %err, "cleanup failed");
        }
        let t = StateMachine::finish(wf, &cleanup);
        self.record_best_effort(wf, t).await;

        match wf.failure() {
            None => info!(
                item = %wf.item.id,
                destination = %wf.item.destination,
                elapsed_ms = u64::try_from(wf.elapsed.as_millis()).unwrap_or(u64::MAX),
                "item completed"
            ),
            Some(failure) => warn!(item = %wf.item.id, failure = %failure, "item failed"),
        }
    }

    /// Release what an abandoned run left in the scratch space.
    async fn release_stale(&self, wf: &WorkflowState) {
        let input = StepInput::from(wf);
        let outcome = self
            .executor
            .execute(StepKind::Cleanup, &input, self.timeouts.cleanup)
            .await;
        if let Some(err) = &outcome.error {
            warn!(item = %wf.item.id, error = %err, "failed to release stale artifacts");
        }
    }

    async fn record(&self, wf: &mut WorkflowState, t: Transition) -> Result<(), JournalError> {
        self.journal
            .append(&wf.item.id, &JournalEntry::transitioned(t.clone()))
            .await?;
        wf.apply(&t);
        Ok(())
    }

    /// Like [`Self::record`], but the transition takes effect even when the
    /// journal rejects it.
    async fn record_best_effort(&self, wf: &mut WorkflowState, t: Transition) {
        if let Err(err) = self
            .journal
            .append(&wf.item.id, &JournalEntry::transitioned(t.clone()))
            .await
        {
            error!(item = %wf.item.id, error = %err, "failed to journal transition");
        }
        wf.apply(&t);
    }
}

fn finished(mut wf: WorkflowState) -> ItemResult {
    match wf.result.take() {
        Some(result) => result,
        None => ItemResult::from_state(&wf, ItemStatus::Failed),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
