use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::SchedulerError;
use crate::execution::{Execution, ExecutionId};
use crate::serializer::Serializer;
use crate::store::ExecutionStore;
use crate::task::TaskInstance;

/// Emitted after a client mutation has been persisted.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Scheduled {
        id: ExecutionId,
        execution_time: DateTime<Utc>,
    },
    Rescheduled {
        id: ExecutionId,
        execution_time: DateTime<Utc>,
    },
    Cancelled {
        id: ExecutionId,
    },
}

pub type ClientEventListener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Schedules, reschedules, cancels and inspects executions.
///
/// Safe to clone and to use from processes that run no scheduler at all;
/// every operation is a single store round-trip.
#[derive(Clone)]
pub struct SchedulerClient {
    store: Arc<dyn ExecutionStore>,
    serializer: Arc<dyn Serializer>,
    clock: Arc<dyn Clock>,
    listener: Option<ClientEventListener>,
}

impl SchedulerClient {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        serializer: Arc<dyn Serializer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            serializer,
            clock,
            listener: None,
        }
    }

    /// Install the single event callback, replacing any previous one.
    pub fn with_listener(mut self, listener: ClientEventListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Persist a new execution due at `execution_time`.
    ///
    /// Returns `false` when an execution with the same identity already
    /// exists; of concurrent callers exactly one sees `true`.
    pub async fn schedule(
        &self,
        instance: TaskInstance,
        execution_time: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let payload = instance
            .payload
            .as_ref()
            .map(|value| self.serializer.serialize(value))
            .transpose()?;

        let id = instance.id();
        let created = self
            .store
            .create_if_not_exists(Execution::new(id.clone(), execution_time, payload))
            .await?;

        if created {
            tracing::debug!(execution = %id, "scheduled execution at {execution_time}");
            self.emit(ClientEvent::Scheduled { id, execution_time });
        } else {
            tracing::debug!(execution = %id, "execution already exists, not scheduling");
        }

        Ok(created)
    }

    /// Move an existing execution to a new due time, clearing its failure
    /// history. On unpicked rows the last caller wins.
    ///
    /// Best-effort on picked rows: the owner's completion update wins the
    /// version race and this call reports `false`.
    pub async fn reschedule(
        &self,
        id: &ExecutionId,
        execution_time: DateTime<Utc>,
    ) -> Result<bool, SchedulerError> {
        let Some(execution) = self.store.get_execution(id).await? else {
            tracing::warn!(execution = %id, "cannot reschedule, no such execution");
            return Ok(false);
        };

        let rescheduled = self
            .store
            .reschedule(
                &execution,
                execution_time,
                execution.last_success,
                execution.last_failure,
                0,
                None,
            )
            .await?;

        if rescheduled {
            self.emit(ClientEvent::Rescheduled {
                id: id.clone(),
                execution_time,
            });
        } else {
            tracing::debug!(execution = %id, "reschedule lost the version race");
        }

        Ok(rescheduled)
    }

    /// Delete an execution.
    ///
    /// Best-effort: a row observed picked is left alone (the owner is
    /// running it), and a cancel racing with a pick loses the version race.
    /// Either way the execution may run once more.
    pub async fn cancel(&self, id: &ExecutionId) -> Result<bool, SchedulerError> {
        let Some(execution) = self.store.get_execution(id).await? else {
            tracing::warn!(execution = %id, "cannot cancel, no such execution");
            return Ok(false);
        };

        if execution.picked {
            tracing::warn!(
                execution = %id,
                picked_by = execution.picked_by.as_deref().unwrap_or(""),
                "cannot cancel execution currently picked by a scheduler"
            );
            return Ok(false);
        }

        let removed = self.store.remove(&execution).await?;
        if removed {
            self.emit(ClientEvent::Cancelled { id: id.clone() });
        }

        Ok(removed)
    }

    pub async fn get_scheduled_execution(
        &self,
        id: &ExecutionId,
    ) -> Result<Option<Execution>, SchedulerError> {
        self.store.get_execution(id).await
    }

    pub async fn get_scheduled_executions(&self) -> Result<Vec<Execution>, SchedulerError> {
        self.store.get_all_executions().await
    }

    pub async fn get_scheduled_executions_for_task(
        &self,
        task_name: &str,
    ) -> Result<Vec<Execution>, SchedulerError> {
        self.store.get_executions_for_task(task_name).await
    }

    /// Unpicked executions that have kept failing for at least
    /// `longer_than`.
    pub async fn get_failing_executions(
        &self,
        longer_than: Duration,
    ) -> Result<Vec<Execution>, SchedulerError> {
        self.store
            .get_failing_longer_than(self.clock.now(), longer_than)
            .await
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(listener) = &self.listener {
            listener(&event);
        }
    }
}
