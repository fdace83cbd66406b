use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskwheel::store::{ExecutionStore, InMemoryExecutionStore};
use taskwheel::task::handlers::OnFailureRetryLater;
use taskwheel::{
    Config, ExecutionId, FixedDelay, JsonSerializer, PollStrategy, SchedulerBuilder,
    SchedulerClient, SchedulerState, SystemClock, Task, TaskInstance, RECURRING_INSTANCE,
};

use crate::wait_until;

fn test_config() -> Config {
    Config::new()
        .threads(4)
        .polling_interval(Duration::from_millis(50))
        .heartbeat_interval(Duration::from_millis(100))
        .shutdown_max_wait(Duration::from_secs(5))
        .scheduler_name("test-scheduler")
}

fn counting_task(name: &str, counter: Arc<AtomicUsize>) -> Task {
    Task::one_time(name, move |_instance, _context| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[tokio::test]
async fn one_time_task_runs_once_and_removes_its_row() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let scheduler = SchedulerBuilder::with_store(store.clone())
        .register(counting_task("notify", counter.clone()))
        .config(test_config())
        .build()
        .await?;

    let client = scheduler.client();
    client
        .schedule(
            TaskInstance::new("notify", "1"),
            Utc::now() + chrono::Duration::milliseconds(100),
        )
        .await?;

    scheduler.start().await?;

    assert!(wait_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst) == 1).await);

    let id = ExecutionId::new("notify", "1");
    let mut removed = false;
    for _ in 0..200 {
        if store.get_execution(&id).await?.is_none() {
            removed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(removed, "completed one-time execution should be deleted");

    // No second run.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    scheduler.stop().await;
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert!(scheduler.get_currently_executing().is_empty());
    Ok(())
}

#[tokio::test]
async fn immediate_execution_beats_the_polling_interval() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let scheduler = SchedulerBuilder::with_store(store)
        .register(counting_task("notify", counter.clone()))
        .config(
            test_config()
                .polling_interval(Duration::from_secs(10))
                .immediate_execution(true),
        )
        .build()
        .await?;

    scheduler.start().await?;
    // Let the startup poll pass so only the waker can explain a fast run.
    tokio::time::sleep(Duration::from_millis(300)).await;

    scheduler
        .client()
        .schedule(
            TaskInstance::new("notify", "now"),
            Utc::now() - chrono::Duration::milliseconds(1),
        )
        .await?;

    assert!(
        wait_until(Duration::from_secs(2), || counter.load(Ordering::SeqCst) == 1).await,
        "execution should run well before the 10s polling interval"
    );

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn failed_execution_is_rescheduled_with_failure_stamps() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());

    let task = Task::one_time("flaky", |_instance, _context| async move {
        Err(anyhow::anyhow!("boom"))
    })
    .with_failure_handler(OnFailureRetryLater::new(Duration::from_secs(3600)));

    let scheduler = SchedulerBuilder::with_store(store.clone())
        .register(task)
        .config(test_config())
        .build()
        .await?;

    scheduler
        .client()
        .schedule(TaskInstance::new("flaky", "1"), Utc::now())
        .await?;
    scheduler.start().await?;

    let id = ExecutionId::new("flaky", "1");
    let mut row = None;
    for _ in 0..500 {
        if let Some(e) = store.get_execution(&id).await? {
            if !e.picked && e.consecutive_failures == 1 {
                row = Some(e);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let row = row.expect("failed execution was not released with failure stamps");
    assert!(row.execution_time > Utc::now() + chrono::Duration::minutes(30));
    assert!(row.last_failure.is_some());
    assert_eq!(row.last_success, None);

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn dead_execution_is_recovered_and_rerun() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let task = Task::recurring(
        "rec",
        FixedDelay::of(Duration::from_secs(3600)),
        {
            let counter = counter.clone();
            move |_instance, _context| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        },
    );

    let scheduler = SchedulerBuilder::with_store(store.clone())
        .register(task)
        .config(test_config().heartbeat_interval(Duration::from_millis(50)))
        .build()
        .await?;

    // A peer picked the execution and died: its heartbeat is far older than
    // dead_after (4 heartbeat intervals).
    scheduler
        .client()
        .schedule(TaskInstance::new("rec", "r1"), Utc::now())
        .await?;
    let row = store
        .get_execution(&ExecutionId::new("rec", "r1"))
        .await?
        .unwrap();
    store
        .pick(&row, Utc::now() - chrono::Duration::seconds(10), "dead-peer")
        .await?
        .expect("setup pick failed");

    scheduler.start().await?;

    assert!(
        wait_until(Duration::from_secs(5), || counter.load(Ordering::SeqCst) >= 1).await,
        "recovered execution should have run"
    );

    // Recovery is not a task failure: once the re-run completes, the row
    // carries a success stamp and no failure history.
    let id = ExecutionId::new("rec", "r1");
    let mut row = None;
    for _ in 0..500 {
        if let Some(e) = store.get_execution(&id).await? {
            if !e.picked && e.last_success.is_some() {
                row = Some(e);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let row = row.expect("recovered execution should be rescheduled after its re-run");
    assert_eq!(row.consecutive_failures, 0);
    assert!(row.last_failure.is_none());

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn parallelism_is_bounded_by_thread_count() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());
    let running = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let task = Task::one_time("slow", {
        let running = running.clone();
        let max_seen = max_seen.clone();
        let done = done.clone();
        move |_instance, _context| {
            let running = running.clone();
            let max_seen = max_seen.clone();
            let done = done.clone();
            async move {
                let current = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    });

    let scheduler = SchedulerBuilder::with_store(store)
        .register(task)
        .config(test_config().threads(2))
        .build()
        .await?;

    let client = scheduler.client();
    for i in 0..3 {
        client
            .schedule(TaskInstance::new("slow", i.to_string()), Utc::now())
            .await?;
    }

    scheduler.start().await?;

    assert!(wait_until(Duration::from_secs(10), || done.load(Ordering::SeqCst) == 3).await);
    assert!(
        max_seen.load(Ordering::SeqCst) <= 2,
        "never more in flight than the thread count"
    );

    scheduler.stop().await;
    assert!(scheduler.get_currently_executing().is_empty());
    Ok(())
}

#[tokio::test]
async fn fetch_and_lock_together_strategy_drains_the_backlog() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let scheduler = SchedulerBuilder::with_store(store.clone())
        .register(counting_task("job", counter.clone()))
        .config(
            test_config()
                .threads(2)
                .poll_strategy(PollStrategy::FetchAndLockTogether),
        )
        .build()
        .await?;

    let client = scheduler.client();
    for i in 0..8 {
        client
            .schedule(TaskInstance::new("job", i.to_string()), Utc::now())
            .await?;
    }

    scheduler.start().await?;

    assert!(
        wait_until(Duration::from_secs(10), || {
            counter.load(Ordering::SeqCst) == 8
        })
        .await,
        "full batches should keep draining until the backlog is empty"
    );

    scheduler.stop().await;
    assert!(scheduler.get_currently_executing().is_empty());
    Ok(())
}

#[tokio::test]
async fn contended_executions_run_exactly_once_across_schedulers() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let scheduler_a = SchedulerBuilder::with_store(store.clone())
        .register(counting_task("job", counter.clone()))
        .config(test_config().scheduler_name("scheduler-a"))
        .build()
        .await?;
    let scheduler_b = SchedulerBuilder::with_store(store.clone())
        .register(counting_task("job", counter.clone()))
        .config(test_config().scheduler_name("scheduler-b"))
        .build()
        .await?;

    let client = scheduler_a.client();
    for i in 0..10 {
        client
            .schedule(TaskInstance::new("job", i.to_string()), Utc::now())
            .await?;
    }

    scheduler_a.start().await?;
    scheduler_b.start().await?;

    let mut all_done = false;
    for _ in 0..500 {
        if store.get_executions_for_task("job").await?.is_empty() {
            all_done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(all_done, "all executions should complete");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 10, "each execution runs exactly once");

    scheduler_a.stop().await;
    scheduler_b.stop().await;
    Ok(())
}

#[tokio::test]
async fn stop_twice_is_a_noop_and_start_after_stop_is_ignored() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = SchedulerBuilder::with_store(store)
        .config(test_config())
        .build()
        .await?;

    scheduler.start().await?;
    scheduler.stop().await;
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    scheduler.stop().await;
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    scheduler.start().await?;
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    Ok(())
}

#[tokio::test]
async fn client_round_trip_reschedule_and_cancel() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());
    let client = SchedulerClient::new(store, Arc::new(JsonSerializer), Arc::new(SystemClock));

    let payload = serde_json::json!({"url": "https://example.com", "attempts": 3});
    let time = Utc::now() + chrono::Duration::hours(1);
    let instance = TaskInstance::new("fetch", "1").with_payload(&payload)?;
    let id = instance.id();

    assert!(client.schedule(instance.clone(), time).await?);
    assert!(!client.schedule(instance, time).await?, "identity is unique");

    let execution = client.get_scheduled_execution(&id).await?.unwrap();
    assert_eq!(execution.execution_time, time);
    assert_eq!(execution.payload, Some(serde_json::to_vec(&payload)?));

    let later = time + chrono::Duration::hours(1);
    assert!(client.reschedule(&id, later).await?);
    let execution = client.get_scheduled_execution(&id).await?.unwrap();
    assert_eq!(execution.execution_time, later);

    assert!(client.cancel(&id).await?);
    assert!(client.get_scheduled_execution(&id).await?.is_none());
    assert!(!client.cancel(&id).await?);
    Ok(())
}

#[tokio::test]
async fn start_tasks_are_inserted_on_startup() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());

    let task = Task::recurring(
        "cleanup",
        FixedDelay::of(Duration::from_secs(3600)),
        |_instance, _context| async move { Ok(()) },
    );

    let scheduler = SchedulerBuilder::with_store(store.clone())
        .start_tasks([task])
        .config(test_config())
        .build()
        .await?;
    scheduler.start().await?;

    let row = store
        .get_execution(&ExecutionId::new("cleanup", RECURRING_INSTANCE))
        .await?
        .expect("start task row should be auto-inserted");
    assert!(row.execution_time > Utc::now() + chrono::Duration::minutes(59));
    assert!(row.execution_time < Utc::now() + chrono::Duration::minutes(61));

    scheduler.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_task_rows_are_left_intact() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());
    let scheduler = SchedulerBuilder::with_store(store.clone())
        .config(test_config())
        .build()
        .await?;

    scheduler
        .client()
        .schedule(TaskInstance::new("ghost", "1"), Utc::now())
        .await?;
    scheduler.start().await?;

    tokio::time::sleep(Duration::from_millis(500)).await;

    let row = store
        .get_execution(&ExecutionId::new("ghost", "1"))
        .await?
        .expect("unknown-task row must never be deleted");
    assert!(!row.picked, "unknown-task rows are not claimed");

    scheduler.stop().await;
    Ok(())
}
