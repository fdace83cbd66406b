use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tracing::Instrument;

use crate::error::SchedulerError;
use crate::execution::{Execution, ExecutionId};
use crate::scheduler::SharedState;
use crate::stats::{ExecutionEvent, SchedulerEvent};
use crate::task::ops::{ExecutionComplete, ExecutionOperations, ExecutionOutcome};
use crate::task::{ExecutionContext, TaskInstance};
use crate::waiter::Waiter;

/// A running execution, as reported by diagnostics.
#[derive(Clone, Debug)]
pub struct CurrentlyExecuting {
    pub execution: Execution,
    pub started_at: DateTime<Utc>,
}

struct ExecutingEntry {
    execution: Execution,
    started_at: DateTime<Utc>,
    abort: Option<AbortHandle>,
}

struct Inner {
    capacity: usize,
    permits: Arc<Semaphore>,
    executing: Mutex<HashMap<ExecutionId, ExecutingEntry>>,
    poll_waiter: Arc<Waiter>,
    more_in_db: AtomicBool,
    lower_limit: usize,
}

/// Bounds in-process parallelism and tracks what is running.
///
/// A permit is held for the entire lifetime of an execution: handler,
/// completion handler and store update included. Every acquisition path
/// hands the permit to an [`ExecutionGuard`], which is the only way it is
/// released.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<Inner>,
}

pub(crate) enum DispatchOutcome {
    Dispatched,
    TakenByPeer,
}

impl Dispatcher {
    pub fn new(capacity: usize, lower_limit: usize, poll_waiter: Arc<Waiter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity,
                permits: Arc::new(Semaphore::new(capacity)),
                executing: Mutex::new(HashMap::new()),
                poll_waiter,
                more_in_db: AtomicBool::new(false),
                lower_limit,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.inner.executing.lock().len()
    }

    /// Acquire a permit without blocking.
    pub fn try_acquire_permit(&self) -> Result<OwnedSemaphorePermit, SchedulerError> {
        self.inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| SchedulerError::NoAvailableExecutors)
    }

    /// Acquire a permit, waiting for one to free up.
    pub async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.inner.permits.clone().acquire_owned().await.ok()
    }

    pub fn set_more_in_db(&self, value: bool) {
        self.inner.more_in_db.store(value, Ordering::Release);
    }

    /// Snapshot of the executions being processed, taken under the lock so
    /// heartbeat I/O happens outside it.
    pub fn snapshot(&self) -> Vec<Execution> {
        self.inner
            .executing
            .lock()
            .values()
            .map(|entry| entry.execution.clone())
            .collect()
    }

    pub fn currently_executing(&self) -> Vec<CurrentlyExecuting> {
        self.inner
            .executing
            .lock()
            .values()
            .map(|entry| CurrentlyExecuting {
                execution: entry.execution.clone(),
                started_at: entry.started_at,
            })
            .collect()
    }

    /// Resolves once every permit is back, i.e. no execution is in flight.
    pub async fn wait_idle(&self) {
        if let Ok(all) = self
            .inner
            .permits
            .acquire_many(self.inner.capacity as u32)
            .await
        {
            drop(all);
        }
    }

    pub fn abort_all(&self) {
        let executing = self.inner.executing.lock();
        for entry in executing.values() {
            if let Some(abort) = &entry.abort {
                abort.abort();
            }
        }
    }
}

/// Owns an execution's permit and currently-processing entry; both are
/// released on drop, whatever path the run took out.
struct ExecutionGuard {
    dispatcher: Dispatcher,
    id: ExecutionId,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        drop(self.permit.take());

        let remaining = {
            let mut executing = self.dispatcher.inner.executing.lock();
            executing.remove(&self.id);
            executing.len()
        };

        // Wake predicate for the fused poll strategy: the last batch was
        // full and in-flight work has drained below the lower limit. The
        // swap clears the flag so each full batch triggers one early poll.
        if remaining < self.dispatcher.inner.lower_limit
            && self.dispatcher.inner.more_in_db.swap(false, Ordering::AcqRel)
        {
            self.dispatcher.inner.poll_waiter.wake();
        }
    }
}

/// Attempt to claim and run one due candidate.
pub(crate) async fn dispatch_due(
    shared: &Arc<SharedState>,
    execution: Execution,
) -> Result<DispatchOutcome, SchedulerError> {
    // An unknown name is not worth a pick: the row is left unpicked and
    // intact so a deployment that knows the task can claim it.
    if shared.registry.resolve(&execution.task_name).is_none() {
        let error = SchedulerError::UnknownTask(execution.task_name.clone());
        tracing::error!(execution = %execution.id(), "{error}, leaving the row intact");
        shared.stats.register(SchedulerEvent::UnresolvedTask);
        return Err(error);
    }

    let permit = match shared.dispatcher.try_acquire_permit() {
        Ok(permit) => permit,
        Err(e) => {
            shared
                .stats
                .register_execution(ExecutionEvent::NoExecutorAvailable);
            return Err(e);
        }
    };

    let now = shared.clock.now();
    let picked = shared
        .store
        .pick(&execution, now, &shared.scheduler_name)
        .await?;

    match picked {
        Some(picked) => {
            spawn_picked(shared, picked, permit);
            Ok(DispatchOutcome::Dispatched)
        }
        None => {
            tracing::debug!(execution = %execution.id(), "execution was taken by a peer");
            shared
                .stats
                .register_execution(ExecutionEvent::TakenByPeer);
            Ok(DispatchOutcome::TakenByPeer)
        }
    }
}

/// Submit an already-claimed execution to the pool.
pub(crate) fn spawn_picked(
    shared: &Arc<SharedState>,
    execution: Execution,
    permit: OwnedSemaphorePermit,
) {
    let id = execution.id();
    let started_at = shared.clock.now();

    shared.dispatcher.inner.executing.lock().insert(
        id.clone(),
        ExecutingEntry {
            execution: execution.clone(),
            started_at,
            abort: None,
        },
    );

    let guard = ExecutionGuard {
        dispatcher: shared.dispatcher.clone(),
        id: id.clone(),
        permit: Some(permit),
    };

    let handle = tokio::spawn(
        run_execution(shared.clone(), execution, guard)
            .instrument(tracing::info_span!("execution", id = %id)),
    );

    // The run may already have finished and removed its entry; only a still
    // present entry gets the abort handle.
    if let Some(entry) = shared.dispatcher.inner.executing.lock().get_mut(&id) {
        entry.abort = Some(handle.abort_handle());
    }
}

async fn run_execution(shared: Arc<SharedState>, execution: Execution, guard: ExecutionGuard) {
    let _guard = guard;
    let id = execution.id();

    let Some(task) = shared.registry.resolve(&execution.task_name) else {
        let error = SchedulerError::UnknownTask(execution.task_name.clone());
        tracing::error!(execution = %id, "{error}, row stays picked until recovery");
        shared.stats.register(SchedulerEvent::UnresolvedTask);
        return;
    };

    let outcome = match decode_instance(&shared, &execution) {
        Ok(instance) => {
            let context = ExecutionContext {
                execution: execution.clone(),
                scheduler_name: shared.scheduler_name.clone(),
            };

            let run = (task.execution_handler())(instance, context);
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(())) => ExecutionOutcome::Success,
                Ok(Err(e)) => ExecutionOutcome::Failure(Some(e)),
                Err(payload) => ExecutionOutcome::Failure(Some(anyhow::anyhow!(
                    "execution handler panicked: {}",
                    panic_message(&payload)
                ))),
            }
        }
        Err(e) => ExecutionOutcome::Failure(Some(e.into())),
    };

    let finished_at = shared.clock.now();
    let ops = ExecutionOperations::new(shared.store.clone(), execution.clone());

    match outcome {
        ExecutionOutcome::Success => {
            shared.stats.register_execution(ExecutionEvent::Completed);

            let completed = ExecutionComplete::success(execution, finished_at);
            if let Err(e) = task.completion_handler().complete(completed, &ops).await {
                tracing::error!(
                    execution = %id,
                    "completion handler failed, row stays picked until recovery: {e:#}"
                );
                shared.stats.register(SchedulerEvent::CompletionHandlerError);
                shared.stats.register_unexpected_error();
            }
        }
        ExecutionOutcome::Failure(cause) => {
            shared.stats.register_execution(ExecutionEvent::Failed);
            if let Some(cause) = &cause {
                tracing::warn!(execution = %id, "execution failed: {cause:#}");
            }

            let completed = ExecutionComplete::failure(execution, finished_at, cause);
            if let Err(e) = task.failure_handler().on_failure(completed, &ops).await {
                tracing::error!(
                    execution = %id,
                    "failure handler failed, row stays picked until recovery: {e:#}"
                );
                shared.stats.register(SchedulerEvent::FailureHandlerError);
                shared.stats.register_unexpected_error();
            }
        }
    }
}

fn decode_instance(
    shared: &Arc<SharedState>,
    execution: &Execution,
) -> Result<TaskInstance, SchedulerError> {
    let payload = execution
        .payload
        .as_deref()
        .map(|bytes| shared.serializer.deserialize(bytes))
        .transpose()?;

    Ok(TaskInstance {
        task_name: execution.task_name.clone(),
        instance_id: execution.instance_id.clone(),
        payload,
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else {
        "Box<dyn Any>"
    }
}
