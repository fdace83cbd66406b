//! A persistent, cluster-safe task scheduler.
//!
//! Executions are durably recorded in a shared database table; any number
//! of scheduler processes poll it for due work and claim each execution
//! with a version-guarded update, so every execution runs to completion on
//! exactly one process. Heartbeats prove the claimant is alive; executions
//! abandoned by a dead process are recovered by per-task policy.

mod client;
mod clock;
mod config;
mod error;
mod execution;
mod executor;
mod flag;
mod registry;
mod scheduler;
mod serializer;
mod stats;
pub mod store;
pub mod task;
mod waiter;

pub use self::client::{ClientEvent, ClientEventListener, SchedulerClient};
pub use self::clock::{Clock, SystemClock};
pub use self::config::{Config, PollStrategy};
pub use self::error::SchedulerError;
pub use self::execution::{Execution, ExecutionId};
pub use self::executor::CurrentlyExecuting;
pub use self::scheduler::{Scheduler, SchedulerBuilder, SchedulerState};
pub use self::serializer::{JsonSerializer, Serializer};
pub use self::stats::{
    ExecutionEvent, MetricsStatsRegistry, NoopStatsRegistry, SchedulerEvent, StatsRegistry,
};
pub use self::task::ops::{ExecutionComplete, ExecutionOperations, ExecutionOutcome};
pub use self::task::{
    ExecutionContext, FixedDelay, Schedule, Task, TaskInstance, RECURRING_INSTANCE,
};
pub use self::waiter::Waiter;
