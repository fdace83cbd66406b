use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::SchedulerError;
use crate::execution::Execution;
use crate::store::ExecutionStore;

/// How a run ended.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Success,
    /// The cause is absent when the failure was observed without an error
    /// object to attach.
    Failure(Option<anyhow::Error>),
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A finished run: the execution as it was picked, when it finished and how.
#[derive(Debug)]
pub struct ExecutionComplete {
    pub execution: Execution,
    pub finished_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
}

impl ExecutionComplete {
    pub fn success(execution: Execution, finished_at: DateTime<Utc>) -> Self {
        Self {
            execution,
            finished_at,
            outcome: ExecutionOutcome::Success,
        }
    }

    pub fn failure(
        execution: Execution,
        finished_at: DateTime<Utc>,
        cause: Option<anyhow::Error>,
    ) -> Self {
        Self {
            execution,
            finished_at,
            outcome: ExecutionOutcome::Failure(cause),
        }
    }
}

/// The row-mutation surface handed to completion, failure and dead-execution
/// handlers.
///
/// All mutations are conditional on the version observed at pick time; a
/// `false` return means a peer got there first and the handler's decision is
/// moot.
pub struct ExecutionOperations {
    store: Arc<dyn ExecutionStore>,
    execution: Execution,
}

impl ExecutionOperations {
    pub fn new(store: Arc<dyn ExecutionStore>, execution: Execution) -> Self {
        Self { store, execution }
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    /// Delete the row.
    pub async fn stop(&self) -> Result<bool, SchedulerError> {
        self.store.remove(&self.execution).await
    }

    /// Clear the pick and move the due time to `next_time`, stamping the
    /// observation columns according to the outcome: success resets
    /// `consecutive_failures`, failure increments it.
    pub async fn reschedule(
        &self,
        completed: &ExecutionComplete,
        next_time: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        self.reschedule_inner(completed, next_time, None).await
    }

    /// Like [`reschedule`](Self::reschedule), also replacing the payload.
    pub async fn reschedule_with_payload(
        &self,
        completed: &ExecutionComplete,
        next_time: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Result<bool, SchedulerError> {
        self.reschedule_inner(completed, next_time, Some(payload)).await
    }

    /// Replace the payload without releasing the row.
    pub async fn update_payload(&self, payload: Option<Vec<u8>>) -> Result<bool, SchedulerError> {
        self.store.update_payload(&self.execution, payload).await
    }

    /// Clear the pick and move the due time, leaving the observation
    /// columns exactly as they are. Recovery of an abandoned row is not a
    /// completion: the task never reported success or failure, so the
    /// stamps and the failure counter must not pretend it did.
    pub async fn revive(&self, next_time: DateTime<Utc>) -> Result<bool, SchedulerError> {
        let e = &self.execution;
        self.store
            .reschedule(
                e,
                next_time,
                e.last_success,
                e.last_failure,
                e.consecutive_failures,
                None,
            )
            .await
    }

    async fn reschedule_inner(
        &self,
        completed: &ExecutionComplete,
        next_time: DateTime<Utc>,
        new_payload: Option<Vec<u8>>,
    ) -> Result<bool, SchedulerError> {
        let e = &self.execution;

        let (last_success, last_failure, consecutive_failures) = match &completed.outcome {
            ExecutionOutcome::Success => (Some(completed.finished_at), e.last_failure, 0),
            ExecutionOutcome::Failure(_) => (
                e.last_success,
                Some(completed.finished_at),
                e.consecutive_failures + 1,
            ),
        };

        self.store
            .reschedule(
                e,
                next_time,
                last_success,
                last_failure,
                consecutive_failures,
                new_payload,
            )
            .await
    }
}
