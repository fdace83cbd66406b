/// Scheduler-level happenings worth counting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerEvent {
    RanExecuteDue,
    RanUpdateHeartbeats,
    RanDetectDeadExecutions,
    FailedHeartbeat,
    CompletionHandlerError,
    FailureHandlerError,
    DeadExecution,
    UnresolvedTask,
}

/// Per-execution outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionEvent {
    Completed,
    Failed,
    TakenByPeer,
    NoExecutorAvailable,
}

/// Sink for scheduler observations.
///
/// The core never interprets these; it only reports. Implementations must
/// be cheap and non-blocking since events are registered from the hot
/// execution path.
pub trait StatsRegistry: Send + Sync {
    fn register(&self, event: SchedulerEvent);
    fn register_execution(&self, event: ExecutionEvent);
    fn register_unexpected_error(&self);
}

/// Default sink emitting `metrics` counters.
///
/// A no-op until the embedding application installs a metrics recorder.
pub struct MetricsStatsRegistry;

impl StatsRegistry for MetricsStatsRegistry {
    fn register(&self, event: SchedulerEvent) {
        metrics::counter!("taskwheel_scheduler_events_total", "event" => scheduler_event_label(event))
            .increment(1);
    }

    fn register_execution(&self, event: ExecutionEvent) {
        metrics::counter!("taskwheel_execution_events_total", "event" => execution_event_label(event))
            .increment(1);
    }

    fn register_unexpected_error(&self) {
        metrics::counter!("taskwheel_unexpected_errors_total").increment(1);
    }
}

pub struct NoopStatsRegistry;

impl StatsRegistry for NoopStatsRegistry {
    fn register(&self, _event: SchedulerEvent) {}

    fn register_execution(&self, _event: ExecutionEvent) {}

    fn register_unexpected_error(&self) {}
}

fn scheduler_event_label(event: SchedulerEvent) -> &'static str {
    match event {
        SchedulerEvent::RanExecuteDue => "ran_execute_due",
        SchedulerEvent::RanUpdateHeartbeats => "ran_update_heartbeats",
        SchedulerEvent::RanDetectDeadExecutions => "ran_detect_dead_executions",
        SchedulerEvent::FailedHeartbeat => "failed_heartbeat",
        SchedulerEvent::CompletionHandlerError => "completion_handler_error",
        SchedulerEvent::FailureHandlerError => "failure_handler_error",
        SchedulerEvent::DeadExecution => "dead_execution",
        SchedulerEvent::UnresolvedTask => "unresolved_task",
    }
}

fn execution_event_label(event: ExecutionEvent) -> &'static str {
    match event {
        ExecutionEvent::Completed => "completed",
        ExecutionEvent::Failed => "failed",
        ExecutionEvent::TakenByPeer => "taken_by_peer",
        ExecutionEvent::NoExecutorAvailable => "no_executor_available",
    }
}
