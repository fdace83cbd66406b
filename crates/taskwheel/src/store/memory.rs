use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::ExecutionStore;
use crate::error::SchedulerError;
use crate::execution::{Execution, ExecutionId};

/// An execution store held entirely in process memory.
///
/// Implements the same version-guarded protocol as the database-backed
/// store, which makes it the workhorse of the test suite and useful for
/// embedders who want scheduler semantics without a database. It is of no
/// use for actual cluster coordination.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    rows: Mutex<HashMap<ExecutionId, Execution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn due_ids(&self, now: DateTime<Utc>, limit: usize) -> Vec<ExecutionId> {
        let rows = self.rows.lock();
        let mut due: Vec<&Execution> = rows
            .values()
            .filter(|e| !e.picked && e.execution_time <= now)
            .collect();
        due.sort_by_key(|e| e.execution_time);
        due.into_iter().take(limit).map(Execution::id).collect()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_if_not_exists(&self, execution: Execution) -> Result<bool, SchedulerError> {
        let mut rows = self.rows.lock();
        let id = execution.id();
        if rows.contains_key(&id) {
            return Ok(false);
        }

        rows.insert(id, Execution::new(execution.id(), execution.execution_time, execution.payload));
        Ok(true)
    }

    async fn get_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let ids = self.due_ids(now, limit);
        let rows = self.rows.lock();
        Ok(ids.iter().filter_map(|id| rows.get(id).cloned()).collect())
    }

    async fn pick(
        &self,
        execution: &Execution,
        now: DateTime<Utc>,
        picked_by: &str,
    ) -> Result<Option<Execution>, SchedulerError> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&execution.id()) else {
            return Ok(None);
        };

        if row.picked || row.version != execution.version {
            return Ok(None);
        }

        row.picked = true;
        row.picked_by = Some(picked_by.to_owned());
        row.last_heartbeat = Some(now);
        row.version += 1;
        Ok(Some(row.clone()))
    }

    async fn pick_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        picked_by: &str,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let ids = self.due_ids(now, limit);
        let mut rows = self.rows.lock();
        let mut picked = Vec::with_capacity(ids.len());

        for id in ids {
            let Some(row) = rows.get_mut(&id) else { continue };
            if row.picked {
                continue;
            }

            row.picked = true;
            row.picked_by = Some(picked_by.to_owned());
            row.last_heartbeat = Some(now);
            row.version += 1;
            picked.push(row.clone());
        }

        Ok(picked)
    }

    async fn update_heartbeat(
        &self,
        execution: &Execution,
        heartbeat_time: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let mut rows = self.rows.lock();
        match rows.get_mut(&execution.id()) {
            Some(row) => row.last_heartbeat = Some(heartbeat_time),
            None => {
                tracing::warn!(execution = %execution.id(), "heartbeat update found no row");
            }
        }
        Ok(())
    }

    async fn get_old_executions(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let rows = self.rows.lock();
        Ok(rows
            .values()
            .filter(|e| e.picked && e.last_heartbeat.is_some_and(|hb| hb < older_than))
            .cloned()
            .collect())
    }

    async fn get_failing_longer_than(
        &self,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let boundary = now
            .checked_sub_signed(
                chrono::Duration::from_std(duration)
                    .unwrap_or(chrono::Duration::MAX),
            )
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let rows = self.rows.lock();
        Ok(rows
            .values()
            .filter(|e| {
                !e.picked
                    && e.consecutive_failures > 0
                    && e.last_success.map_or(true, |s| s < boundary)
            })
            .cloned()
            .collect())
    }

    async fn reschedule(
        &self,
        execution: &Execution,
        next_time: DateTime<Utc>,
        last_success: Option<DateTime<Utc>>,
        last_failure: Option<DateTime<Utc>>,
        consecutive_failures: i32,
        new_payload: Option<Vec<u8>>,
    ) -> Result<bool, SchedulerError> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&execution.id()) else {
            return Ok(false);
        };

        if row.version != execution.version {
            return Ok(false);
        }

        row.picked = false;
        row.picked_by = None;
        row.last_heartbeat = None;
        row.execution_time = next_time;
        row.last_success = last_success;
        row.last_failure = last_failure;
        row.consecutive_failures = consecutive_failures;
        if let Some(payload) = new_payload {
            row.payload = Some(payload);
        }
        row.version += 1;
        Ok(true)
    }

    async fn remove(&self, execution: &Execution) -> Result<bool, SchedulerError> {
        let mut rows = self.rows.lock();
        match rows.get(&execution.id()) {
            Some(row) if row.version == execution.version => {
                rows.remove(&execution.id());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_payload(
        &self,
        execution: &Execution,
        payload: Option<Vec<u8>>,
    ) -> Result<bool, SchedulerError> {
        let mut rows = self.rows.lock();
        let Some(row) = rows.get_mut(&execution.id()) else {
            return Ok(false);
        };

        if row.version != execution.version {
            return Ok(false);
        }

        row.payload = payload;
        row.version += 1;
        Ok(true)
    }

    async fn get_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<Execution>, SchedulerError> {
        Ok(self.rows.lock().get(id).cloned())
    }

    async fn get_executions_for_task(
        &self,
        task_name: &str,
    ) -> Result<Vec<Execution>, SchedulerError> {
        let rows = self.rows.lock();
        let mut executions: Vec<Execution> = rows
            .values()
            .filter(|e| e.task_name == task_name)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.execution_time);
        Ok(executions)
    }

    async fn get_all_executions(&self) -> Result<Vec<Execution>, SchedulerError> {
        let rows = self.rows.lock();
        let mut executions: Vec<Execution> = rows.values().cloned().collect();
        executions.sort_by_key(|e| e.execution_time);
        Ok(executions)
    }
}
