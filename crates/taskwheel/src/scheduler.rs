use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_concurrency::future::Join;
use parking_lot::Mutex;
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::client::{ClientEvent, SchedulerClient};
use crate::clock::{Clock, SystemClock};
use crate::config::{default_scheduler_name, Config, PollStrategy};
use crate::error::SchedulerError;
use crate::execution::{Execution, ExecutionId};
use crate::executor::{self, CurrentlyExecuting, Dispatcher};
use crate::flag::{ShutdownFlag, ShutdownGuard};
use crate::registry::TaskRegistry;
use crate::serializer::{JsonSerializer, Serializer};
use crate::stats::{MetricsStatsRegistry, SchedulerEvent, StatsRegistry};
use crate::store::{ExecutionStore, PgExecutionStore};
use crate::task::ops::ExecutionOperations;
use crate::task::{Task, RECURRING_INSTANCE};
use crate::waiter::Waiter;

const STATE_CREATED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_STOPPED: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Created,
    Started,
    ShuttingDown,
    Stopped,
}

fn state_from_u8(value: u8) -> SchedulerState {
    match value {
        STATE_CREATED => SchedulerState::Created,
        STATE_STARTED => SchedulerState::Started,
        STATE_SHUTTING_DOWN => SchedulerState::ShuttingDown,
        _ => SchedulerState::Stopped,
    }
}

pub(crate) struct SharedState {
    pub shutdown: ShutdownFlag,
    pub store: Arc<dyn ExecutionStore>,
    pub registry: TaskRegistry,
    pub serializer: Arc<dyn Serializer>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<dyn StatsRegistry>,
    pub config: Config,
    pub scheduler_name: String,
    pub dispatcher: Dispatcher,
    pub poll_waiter: Arc<Waiter>,
    start_task_names: Vec<String>,
    state: AtomicU8,
}

enum Backend {
    Pool(sqlx::PgPool),
    Store(Arc<dyn ExecutionStore>),
}

pub struct SchedulerBuilder {
    backend: Backend,
    tasks: Vec<Task>,
    start_task_names: Vec<String>,
    config: Config,
    clock: Arc<dyn Clock>,
    stats: Arc<dyn StatsRegistry>,
    serializer: Arc<dyn Serializer>,
    create_schema: bool,
}

impl SchedulerBuilder {
    /// A scheduler persisting to PostgreSQL.
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self::with_backend(Backend::Pool(pool))
    }

    /// A scheduler over a custom execution store, e.g.
    /// [`InMemoryExecutionStore`](crate::store::InMemoryExecutionStore)
    /// in tests.
    pub fn with_store(store: Arc<dyn ExecutionStore>) -> Self {
        Self::with_backend(Backend::Store(store))
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            tasks: Vec::new(),
            start_task_names: Vec::new(),
            config: Config::default(),
            clock: Arc::new(SystemClock),
            stats: Arc::new(MetricsStatsRegistry),
            serializer: Arc::new(JsonSerializer),
            create_schema: false,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn register(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    /// Register recurring tasks whose row is auto-inserted on startup if
    /// absent.
    pub fn start_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        for task in tasks {
            self.start_task_names.push(task.name().to_owned());
            self.tasks.push(task);
        }
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(mut self, stats: Arc<dyn StatsRegistry>) -> Self {
        self.stats = stats;
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Whether to create the table and index at build time if missing.
    ///
    /// A low-effort way to keep a single-scheduler deployment consistent;
    /// larger clusters should manage the schema themselves.
    pub fn create_schema(mut self, create: bool) -> Self {
        self.create_schema = create;
        self
    }

    pub async fn build(self) -> Result<Scheduler, SchedulerError> {
        let store: Arc<dyn ExecutionStore> = match self.backend {
            Backend::Store(store) => store,
            Backend::Pool(pool) => {
                let store = PgExecutionStore::new(pool, &self.config.table_name)?;
                if self.create_schema {
                    store.create_schema_if_needed().await?;
                }
                Arc::new(store)
            }
        };

        let scheduler_name = self
            .config
            .scheduler_name
            .clone()
            .unwrap_or_else(default_scheduler_name);

        let poll_waiter = Arc::new(Waiter::new(self.config.polling_interval, self.clock.clone()));
        let dispatcher = Dispatcher::new(
            self.config.threads,
            self.config.lower_limit(),
            poll_waiter.clone(),
        );

        let mut client = SchedulerClient::new(
            store.clone(),
            self.serializer.clone(),
            self.clock.clone(),
        );
        if self.config.immediate_execution {
            let waiter = poll_waiter.clone();
            let clock = self.clock.clone();
            client = client.with_listener(Arc::new(move |event| {
                let execution_time = match event {
                    ClientEvent::Scheduled { execution_time, .. }
                    | ClientEvent::Rescheduled { execution_time, .. } => *execution_time,
                    ClientEvent::Cancelled { .. } => return,
                };

                if execution_time <= clock.now() {
                    waiter.wake();
                }
            }));
        }

        let shared = Arc::new(SharedState {
            shutdown: ShutdownFlag::new(),
            store,
            registry: TaskRegistry::new(self.tasks),
            serializer: self.serializer,
            clock: self.clock,
            stats: self.stats,
            config: self.config,
            scheduler_name,
            dispatcher,
            poll_waiter,
            start_task_names: self.start_task_names,
            state: AtomicU8::new(STATE_CREATED),
        });

        Ok(Scheduler {
            shared,
            client,
            run_handle: Mutex::new(None),
        })
    }
}

/// The scheduler: polls for due executions, runs them on a bounded pool,
/// keeps their liveness stamps fresh and recovers executions abandoned by
/// dead peers.
pub struct Scheduler {
    shared: Arc<SharedState>,
    client: SchedulerClient,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn client(&self) -> SchedulerClient {
        self.client.clone()
    }

    pub fn state(&self) -> SchedulerState {
        state_from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn scheduler_name(&self) -> &str {
        &self.shared.scheduler_name
    }

    /// Snapshot of the executions this scheduler is running right now.
    pub fn get_currently_executing(&self) -> Vec<CurrentlyExecuting> {
        self.shared.dispatcher.currently_executing()
    }

    /// Wake the due-poll loop without waiting for the next tick.
    pub fn trigger_check_for_due_executions(&self) {
        self.shared.poll_waiter.wake();
    }

    /// Launch the background loops. Idempotent; a second call warns and
    /// does nothing.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let transitioned = self
            .shared
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !transitioned {
            tracing::warn!(
                "start() called on a scheduler in state {:?}, ignoring",
                self.state()
            );
            return Ok(());
        }

        if let Err(e) = self.insert_start_tasks().await {
            self.shared.state.store(STATE_CREATED, Ordering::Release);
            return Err(e);
        }

        tracing::info!(
            name = %self.shared.scheduler_name,
            threads = self.shared.dispatcher.capacity(),
            "starting scheduler"
        );

        let handle = tokio::spawn(Self::run(self.shared.clone()));
        *self.run_handle.lock() = Some(handle);

        // The first poll runs right away instead of one interval in.
        self.shared.poll_waiter.wake();
        Ok(())
    }

    /// Stop the background loops, letting in-flight executions finish
    /// within the configured grace period. Idempotent; a second call warns
    /// and does nothing.
    pub async fn stop(&self) {
        let transitioned = self
            .shared
            .state
            .compare_exchange(
                STATE_STARTED,
                STATE_SHUTTING_DOWN,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !transitioned {
            match self.state() {
                SchedulerState::Created => {
                    self.shared.state.store(STATE_STOPPED, Ordering::Release);
                    tracing::warn!("stop() called on a scheduler that was never started");
                }
                state => tracing::warn!("stop() called on a scheduler in state {state:?}, ignoring"),
            }
            return;
        }

        tracing::info!("shutting down scheduler");
        self.shared.shutdown.raise();

        let handle = self.run_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("scheduler run task failed during shutdown: {e}");
            }
        }

        self.shared.state.store(STATE_STOPPED, Ordering::Release);
        tracing::info!("scheduler stopped");
    }

    async fn insert_start_tasks(&self) -> Result<(), SchedulerError> {
        for name in &self.shared.start_task_names {
            let Some(task) = self.shared.registry.resolve(name) else {
                continue;
            };
            let Some(schedule) = task.schedule() else {
                tracing::warn!("start task `{name}` has no schedule, skipping auto-insert");
                continue;
            };

            let now = self.shared.clock.now();
            let execution_time = schedule.next_execution_time(now);
            let created = self
                .shared
                .store
                .create_if_not_exists(Execution::new(
                    ExecutionId::new(name.clone(), RECURRING_INSTANCE),
                    execution_time,
                    None,
                ))
                .await?;

            if created {
                tracing::info!("created execution for start task `{name}` at {execution_time}");
            }
        }

        Ok(())
    }

    async fn run(shared: Arc<SharedState>) {
        let poll = Self::poll_loop(shared.clone());
        let heartbeat = Self::heartbeat_loop(shared.clone());
        let dead = Self::dead_execution_loop(shared.clone());

        let name = shared.scheduler_name.clone();
        let _ = (poll, heartbeat, dead)
            .join()
            .instrument(tracing::info_span!("scheduler", name = %name))
            .await;
    }

    async fn poll_loop(shared: Arc<SharedState>) {
        let _guard = ShutdownGuard::new(&shared.shutdown);

        loop {
            tokio::select! {
                biased;

                _ = shared.shutdown.wait() => break,
                _ = shared.poll_waiter.wait() => {}
            }
            if shared.shutdown.is_raised() {
                break;
            }

            if let Err(e) = Self::poll_once(&shared).await {
                tracing::error!("due-execution poll failed: {e:#}");
                shared.stats.register_unexpected_error();
            }
        }

        // Let in-flight executions run out within the grace period; the
        // stragglers are aborted and recovered by a peer after dead_after.
        let in_flight = shared.dispatcher.in_flight();
        if in_flight > 0 {
            tracing::info!(
                "waiting up to {} for {in_flight} running executions",
                humantime::Duration::from(shared.config.shutdown_max_wait)
            );
        }

        let drained = tokio::time::timeout(
            shared.config.shutdown_max_wait,
            shared.dispatcher.wait_idle(),
        )
        .await;
        if drained.is_err() {
            tracing::warn!(
                "shutdown grace period expired, aborting {} executions",
                shared.dispatcher.in_flight()
            );
            shared.dispatcher.abort_all();
        }
    }

    async fn poll_once(shared: &Arc<SharedState>) -> Result<(), SchedulerError> {
        shared.stats.register(SchedulerEvent::RanExecuteDue);
        let now = shared.clock.now();
        let upper = shared.config.upper_limit();

        match shared.config.poll_strategy {
            PollStrategy::FetchAndLockSeparately => {
                let due = shared.store.get_due(now, upper).await?;
                if !due.is_empty() {
                    tracing::debug!("found {} due executions", due.len());
                }

                for execution in due {
                    if shared.shutdown.is_raised() {
                        break;
                    }

                    match executor::dispatch_due(shared, execution).await {
                        Ok(_) => {}
                        Err(SchedulerError::NoAvailableExecutors) => {
                            tracing::debug!("all executors are busy, yielding to the next poll");
                            break;
                        }
                        // Already logged and counted; the row stays for a
                        // deployment that knows the task.
                        Err(SchedulerError::UnknownTask(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            PollStrategy::FetchAndLockTogether => {
                let slots = upper.saturating_sub(shared.dispatcher.in_flight());
                if slots == 0 {
                    return Ok(());
                }

                let batch = shared
                    .store
                    .pick_due(now, slots, &shared.scheduler_name)
                    .await?;
                shared.dispatcher.set_more_in_db(batch.len() == slots);
                if !batch.is_empty() {
                    tracing::debug!("picked {} due executions", batch.len());
                }

                for execution in batch {
                    // The batch is bounded by free capacity, so the wait is
                    // only ever against a guard that has not finished
                    // dropping.
                    let Some(permit) = shared.dispatcher.acquire_permit().await else {
                        break;
                    };
                    executor::spawn_picked(shared, execution, permit);
                }
            }
        }

        Ok(())
    }

    async fn heartbeat_loop(shared: Arc<SharedState>) {
        let _guard = ShutdownGuard::new(&shared.shutdown);

        loop {
            let period = jittered(shared.config.heartbeat_interval);
            tokio::select! {
                biased;

                _ = shared.shutdown.wait() => break,
                _ = shared.clock.sleep(period) => {}
            }
            if shared.shutdown.is_raised() {
                break;
            }

            let executing = shared.dispatcher.snapshot();
            if executing.is_empty() {
                continue;
            }

            shared.stats.register(SchedulerEvent::RanUpdateHeartbeats);
            let now = shared.clock.now();
            tracing::debug!("updating heartbeats for {} executions", executing.len());

            for execution in executing {
                if let Err(e) = shared.store.update_heartbeat(&execution, now).await {
                    // A missed heartbeat self-corrects: enough of them and
                    // the row is recovered by dead-execution detection.
                    tracing::error!(
                        execution = %execution.id(),
                        "failed to update heartbeat: {e}"
                    );
                    shared.stats.register(SchedulerEvent::FailedHeartbeat);
                    shared.stats.register_unexpected_error();
                }
            }
        }
    }

    async fn dead_execution_loop(shared: Arc<SharedState>) {
        let _guard = ShutdownGuard::new(&shared.shutdown);

        loop {
            let period = jittered(shared.config.heartbeat_interval * 2);
            tokio::select! {
                biased;

                _ = shared.shutdown.wait() => break,
                _ = shared.clock.sleep(period) => {}
            }
            if shared.shutdown.is_raised() {
                break;
            }

            if let Err(e) = Self::detect_dead_once(&shared).await {
                tracing::error!("dead-execution detection failed: {e:#}");
                shared.stats.register_unexpected_error();
            }
        }
    }

    async fn detect_dead_once(shared: &Arc<SharedState>) -> Result<(), SchedulerError> {
        shared.stats.register(SchedulerEvent::RanDetectDeadExecutions);

        let now = shared.clock.now();
        let dead_after = chrono::Duration::from_std(shared.config.dead_after())
            .unwrap_or(chrono::Duration::MAX);
        let older_than = now
            .checked_sub_signed(dead_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let dead = shared.store.get_old_executions(older_than).await?;
        if dead.is_empty() {
            return Ok(());
        }

        tracing::warn!("found {} dead executions", dead.len());
        for execution in dead {
            if shared.shutdown.is_raised() {
                break;
            }

            shared.stats.register(SchedulerEvent::DeadExecution);
            let id = execution.id();

            let Some(task) = shared.registry.resolve(&execution.task_name) else {
                let error = SchedulerError::UnknownTask(execution.task_name.clone());
                tracing::error!(execution = %id, "dead execution: {error}, leaving the row intact");
                shared.stats.register(SchedulerEvent::UnresolvedTask);
                continue;
            };

            tracing::warn!(
                execution = %id,
                picked_by = execution.picked_by.as_deref().unwrap_or(""),
                last_heartbeat = ?execution.last_heartbeat,
                "recovering dead execution"
            );

            let ops = ExecutionOperations::new(shared.store.clone(), execution.clone());
            if let Err(e) = task
                .dead_execution_handler()
                .on_dead_execution(execution, now, &ops)
                .await
            {
                tracing::error!(execution = %id, "dead-execution handler failed: {e:#}");
                shared.stats.register_unexpected_error();
            }
        }

        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.raise();
    }
}

/// Periodic loops jitter their period downwards by up to a quarter to
/// avoid thundering herds on the database server.
fn jittered(period: Duration) -> Duration {
    let quarter = period / 4;
    if quarter.is_zero() {
        return period;
    }

    let jitter = rand::thread_rng().gen_range(0..quarter.as_nanos());
    period - Duration::from_nanos(jitter as u64)
}
