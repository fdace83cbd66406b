use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ops::{ExecutionComplete, ExecutionOperations};
use super::Schedule;
use crate::execution::Execution;

/// Decides what happens to the row after a successful run.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn complete(
        &self,
        completed: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> anyhow::Result<()>;
}

/// Decides what happens to the row after the execution handler errored.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn on_failure(
        &self,
        completed: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> anyhow::Result<()>;
}

/// Recovery policy for a picked row whose owner stopped heartbeating.
#[async_trait]
pub trait DeadExecutionHandler: Send + Sync {
    async fn on_dead_execution(
        &self,
        execution: Execution,
        now: DateTime<Utc>,
        ops: &ExecutionOperations,
    ) -> anyhow::Result<()>;
}

/// Delete the row. The default for one-time tasks.
pub struct OnCompleteRemove;

#[async_trait]
impl CompletionHandler for OnCompleteRemove {
    async fn complete(
        &self,
        _completed: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> anyhow::Result<()> {
        ops.stop().await?;
        Ok(())
    }
}

/// Reschedule per the task's schedule. The default for recurring tasks.
pub struct OnCompleteReschedule {
    schedule: Arc<dyn Schedule>,
}

impl OnCompleteReschedule {
    pub fn new(schedule: Arc<dyn Schedule>) -> Self {
        Self { schedule }
    }
}

#[async_trait]
impl CompletionHandler for OnCompleteReschedule {
    async fn complete(
        &self,
        completed: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> anyhow::Result<()> {
        let next = self.schedule.next_execution_time(completed.finished_at);
        ops.reschedule(&completed, next).await?;
        Ok(())
    }
}

/// Retry a fixed delay after the failure.
pub struct OnFailureRetryLater {
    delay: Duration,
}

impl OnFailureRetryLater {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl FailureHandler for OnFailureRetryLater {
    async fn on_failure(
        &self,
        completed: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> anyhow::Result<()> {
        let next = next_after(completed.finished_at, self.delay);
        tracing::debug!(
            execution = %completed.execution.id(),
            "retrying failed execution at {next}"
        );
        ops.reschedule(&completed, next).await?;
        Ok(())
    }
}

/// Move on to the schedule's next slot instead of retrying.
pub struct OnFailureReschedule {
    schedule: Arc<dyn Schedule>,
}

impl OnFailureReschedule {
    pub fn new(schedule: Arc<dyn Schedule>) -> Self {
        Self { schedule }
    }
}

#[async_trait]
impl FailureHandler for OnFailureReschedule {
    async fn on_failure(
        &self,
        completed: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> anyhow::Result<()> {
        let next = self.schedule.next_execution_time(completed.finished_at);
        ops.reschedule(&completed, next).await?;
        Ok(())
    }
}

/// Retry with `base × 2^consecutive_failures`, capped at `max`.
pub struct OnFailureExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl OnFailureExponentialBackoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            max: Duration::from_secs(24 * 3600),
        }
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    fn delay_for(&self, consecutive_failures: i32) -> Duration {
        // Clamp the exponent before the shift; beyond 31 doublings the cap
        // has long since taken over anyway.
        let exponent = consecutive_failures.clamp(0, 31) as u32;
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

#[async_trait]
impl FailureHandler for OnFailureExponentialBackoff {
    async fn on_failure(
        &self,
        completed: ExecutionComplete,
        ops: &ExecutionOperations,
    ) -> anyhow::Result<()> {
        let delay = self.delay_for(completed.execution.consecutive_failures);
        let next = next_after(completed.finished_at, delay);
        tracing::debug!(
            execution = %completed.execution.id(),
            "retrying failed execution at {next} after {} backoff",
            humantime::Duration::from(delay)
        );
        ops.reschedule(&completed, next).await?;
        Ok(())
    }
}

/// Clear the pick and make the execution due immediately, leaving the
/// success/failure stamps untouched.
pub struct RescheduleDeadExecution;

#[async_trait]
impl DeadExecutionHandler for RescheduleDeadExecution {
    async fn on_dead_execution(
        &self,
        execution: Execution,
        now: DateTime<Utc>,
        ops: &ExecutionOperations,
    ) -> anyhow::Result<()> {
        tracing::warn!(execution = %execution.id(), "rescheduling dead execution to run now");
        ops.revive(now).await?;
        Ok(())
    }
}

/// Delete the abandoned row.
pub struct CancelDeadExecution;

#[async_trait]
impl DeadExecutionHandler for CancelDeadExecution {
    async fn on_dead_execution(
        &self,
        execution: Execution,
        _now: DateTime<Utc>,
        ops: &ExecutionOperations,
    ) -> anyhow::Result<()> {
        tracing::warn!(execution = %execution.id(), "cancelling dead execution");
        ops.stop().await?;
        Ok(())
    }
}

fn next_after(finished_at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
    finished_at
        .checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
