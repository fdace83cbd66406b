use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SchedulerError;
use crate::execution::{Execution, ExecutionId};

pub mod handlers;
pub mod ops;

use self::handlers::{
    CompletionHandler, DeadExecutionHandler, FailureHandler, OnCompleteRemove,
    OnCompleteReschedule, OnFailureReschedule, OnFailureRetryLater, RescheduleDeadExecution,
};

/// The instance id under which a recurring task's single row is kept.
pub const RECURRING_INSTANCE: &str = "recurring";

/// Maps a completion time to the next execution time.
pub trait Schedule: Send + Sync {
    fn next_execution_time(&self, completion_time: DateTime<Utc>) -> DateTime<Utc>;
}

/// Re-run a fixed delay after each completion.
#[derive(Clone, Copy, Debug)]
pub struct FixedDelay(Duration);

impl FixedDelay {
    pub fn of(delay: Duration) -> Self {
        Self(delay)
    }
}

impl Schedule for FixedDelay {
    fn next_execution_time(&self, completion_time: DateTime<Utc>) -> DateTime<Utc> {
        let delay =
            chrono::Duration::from_std(self.0).unwrap_or(chrono::Duration::MAX);
        completion_time
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// A concrete scheduled invocation of a task.
///
/// The payload is carried as a `serde_json::Value` until the client encodes
/// it with the configured codec at persistence time.
#[derive(Clone, Debug)]
pub struct TaskInstance {
    pub task_name: String,
    pub instance_id: String,
    pub payload: Option<serde_json::Value>,
}

impl TaskInstance {
    pub fn new(task_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            instance_id: instance_id.into(),
            payload: None,
        }
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, SchedulerError> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Decode the payload into the type the task expects.
    pub fn typed_payload<T: DeserializeOwned>(&self) -> Result<Option<T>, SchedulerError> {
        self.payload
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .map_err(SchedulerError::from)
    }

    pub fn id(&self) -> ExecutionId {
        ExecutionId::new(self.task_name.clone(), self.instance_id.clone())
    }
}

/// State handed to the execution handler alongside the instance.
#[derive(Clone)]
pub struct ExecutionContext {
    pub execution: Execution,
    pub scheduler_name: String,
}

pub type ExecutionHandler = Arc<
    dyn Fn(TaskInstance, ExecutionContext) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// A registered task: a name plus the handlers that run it, complete it,
/// absorb its failures and recover its abandoned executions.
///
/// The factory constructors cover the common shapes; handler overrides
/// compose on top of any of them.
#[derive(Clone)]
pub struct Task {
    name: String,
    execute: ExecutionHandler,
    completion_handler: Arc<dyn CompletionHandler>,
    failure_handler: Arc<dyn FailureHandler>,
    dead_execution_handler: Arc<dyn DeadExecutionHandler>,
    schedule: Option<Arc<dyn Schedule>>,
}

impl Task {
    /// A task that runs once and removes its row on success.
    ///
    /// Failures retry after five minutes until overridden with
    /// [`with_failure_handler`](Task::with_failure_handler).
    pub fn one_time<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskInstance, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: boxed(handler),
            completion_handler: Arc::new(OnCompleteRemove),
            failure_handler: Arc::new(OnFailureRetryLater::new(Duration::from_secs(5 * 60))),
            dead_execution_handler: Arc::new(RescheduleDeadExecution),
            schedule: None,
        }
    }

    /// A task that reschedules itself per `schedule` after every completion,
    /// successful or not.
    pub fn recurring<F, Fut, S>(name: impl Into<String>, schedule: S, handler: F) -> Self
    where
        F: Fn(TaskInstance, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        S: Schedule + 'static,
    {
        let schedule: Arc<dyn Schedule> = Arc::new(schedule);

        Self {
            name: name.into(),
            execute: boxed(handler),
            completion_handler: Arc::new(OnCompleteReschedule::new(schedule.clone())),
            failure_handler: Arc::new(OnFailureReschedule::new(schedule.clone())),
            dead_execution_handler: Arc::new(RescheduleDeadExecution),
            schedule: Some(schedule),
        }
    }

    /// A task with a caller-supplied completion handler.
    pub fn custom<F, Fut>(
        name: impl Into<String>,
        completion_handler: Arc<dyn CompletionHandler>,
        handler: F,
    ) -> Self
    where
        F: Fn(TaskInstance, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: boxed(handler),
            completion_handler,
            failure_handler: Arc::new(OnFailureRetryLater::new(Duration::from_secs(5 * 60))),
            dead_execution_handler: Arc::new(RescheduleDeadExecution),
            schedule: None,
        }
    }

    pub fn with_failure_handler(mut self, handler: impl FailureHandler + 'static) -> Self {
        self.failure_handler = Arc::new(handler);
        self
    }

    pub fn with_dead_execution_handler(
        mut self,
        handler: impl DeadExecutionHandler + 'static,
    ) -> Self {
        self.dead_execution_handler = Arc::new(handler);
        self
    }

    /// An instance of this task without payload.
    pub fn instance(&self, instance_id: impl Into<String>) -> TaskInstance {
        TaskInstance::new(self.name.clone(), instance_id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule(&self) -> Option<&Arc<dyn Schedule>> {
        self.schedule.as_ref()
    }

    pub(crate) fn execution_handler(&self) -> &ExecutionHandler {
        &self.execute
    }

    pub(crate) fn completion_handler(&self) -> &Arc<dyn CompletionHandler> {
        &self.completion_handler
    }

    pub(crate) fn failure_handler(&self) -> &Arc<dyn FailureHandler> {
        &self.failure_handler
    }

    pub(crate) fn dead_execution_handler(&self) -> &Arc<dyn DeadExecutionHandler> {
        &self.dead_execution_handler
    }
}

fn boxed<F, Fut>(handler: F) -> ExecutionHandler
where
    F: Fn(TaskInstance, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |instance, context| Box::pin(handler(instance, context)))
}
