//! Durable persistence of executions.
//!
//! The store is the protocol heart: the version-guarded [`pick`] update is
//! the linearization point that assigns an execution to exactly one
//! scheduler. Every conditional operation that loses the version race
//! reports it as a non-fatal stale result (`Ok(None)` / `Ok(false)`) which
//! callers treat as "someone else has it".
//!
//! [`pick`]: ExecutionStore::pick

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SchedulerError;
use crate::execution::{Execution, ExecutionId};

mod memory;
mod postgres;

pub use self::memory::InMemoryExecutionStore;
pub use self::postgres::PgExecutionStore;

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert atomically; returns whether insertion happened. Concurrent
    /// callers with the same identity see exactly one winner.
    async fn create_if_not_exists(&self, execution: Execution) -> Result<bool, SchedulerError>;

    /// Up to `limit` unpicked rows due at `now`, ordered by execution time
    /// ascending. A candidate list only; no locking.
    async fn get_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, SchedulerError>;

    /// Atomically claim one execution: set `picked`, `picked_by` and the
    /// heartbeat stamp, guarded by the observed `version` and
    /// `picked = false`. Returns the updated row, or `None` on a lost race.
    async fn pick(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
        picked_by: &str,
    ) -> Result<Option<Execution>, SchedulerError>;

    /// Fused fetch-and-claim for backends supporting
    /// `SELECT … FOR UPDATE SKIP LOCKED`: returns up to `limit` already
    /// picked rows in one round-trip, ordered by execution time ascending.
    async fn pick_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        picked_by: &str,
    ) -> Result<Vec<Execution>, SchedulerError>;

    /// Unconditional refresh of the liveness stamp for an owned row. A
    /// missing row is logged, not an error. Does not touch `version`.
    async fn update_heartbeat(
        &self,
        execution: &Execution,
        heartbeat_time: DateTime<Utc>,
    ) -> Result<(), SchedulerError>;

    /// Picked rows whose heartbeat is older than `older_than`, making them
    /// candidates for dead-execution recovery.
    async fn get_old_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Execution>, SchedulerError>;

    /// Unpicked rows that have been failing for longer than `duration`:
    /// `consecutive_failures > 0` and no success within the window.
    async fn get_failing_longer_than(
        &self,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Vec<Execution>, SchedulerError>;

    /// Conditional on `version`: clear the pick, move the due time, stamp
    /// the observation columns and optionally replace the payload.
    #[allow(clippy::too_many_arguments)]
    async fn reschedule(
        &self,
        execution: &Execution,
        next_time: DateTime<Utc>,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
        consecutive_failures: i32,
        new_payload: Option<Vec<u8>>,
    ) -> Result<bool, SchedulerError>;

    /// Conditional delete by `version`.
    async fn remove(&self, execution: &Execution) -> Result<bool, SchedulerError>;

    /// Conditional payload replacement by `version`.
    async fn update_payload(
        &self,
        execution: &Execution,
        payload: Option<Vec<u8>>,
    ) -> Result<bool, SchedulerError>;

    async fn get_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<Execution>, SchedulerError>;

    async fn get_executions_for_task(
        &self,
        task_name: &str,
    ) -> Result<Vec<Execution>, SchedulerError>;

    async fn get_all_executions(&self) -> Result<Vec<Execution>, SchedulerError>;
}
