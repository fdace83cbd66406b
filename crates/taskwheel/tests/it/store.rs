use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskwheel::store::{ExecutionStore, InMemoryExecutionStore};
use taskwheel::{Execution, ExecutionId};

fn execution(task: &str, instance: &str, due_in_ms: i64) -> Execution {
    Execution::new(
        ExecutionId::new(task, instance),
        Utc::now() + chrono::Duration::milliseconds(due_in_ms),
        None,
    )
}

#[tokio::test]
async fn create_if_not_exists_has_exactly_one_winner() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());

    let mut creates = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        creates.push(tokio::spawn(async move {
            store.create_if_not_exists(execution("t", "1", 0)).await
        }));
    }

    let mut winners = 0;
    for create in creates {
        if create.await?? {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    Ok(())
}

#[tokio::test]
async fn pick_succeeds_for_exactly_one_contender() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryExecutionStore::new());
    store.create_if_not_exists(execution("t", "1", -10)).await?;

    let candidate = store.get_due(Utc::now(), 10).await?.remove(0);

    let mut picks = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        let candidate = candidate.clone();
        picks.push(tokio::spawn(async move {
            store
                .pick(&candidate, Utc::now(), &format!("scheduler-{i}"))
                .await
        }));
    }

    let mut claimed = 0;
    for pick in picks {
        if pick.await??.is_some() {
            claimed += 1;
        }
    }

    assert_eq!(claimed, 1);
    Ok(())
}

#[tokio::test]
async fn version_strictly_increases_across_lifecycle() -> anyhow::Result<()> {
    let store = InMemoryExecutionStore::new();
    store.create_if_not_exists(execution("t", "1", -10)).await?;

    let id = ExecutionId::new("t", "1");
    let created = store.get_execution(&id).await?.unwrap();
    assert_eq!(created.version, 1);
    assert!(!created.picked);

    let picked = store.pick(&created, Utc::now(), "a").await?.unwrap();
    assert_eq!(picked.version, 2);
    assert!(picked.picked);

    // A pick against the stale version loses.
    assert!(store.pick(&created, Utc::now(), "b").await?.is_none());

    let now = Utc::now();
    assert!(
        store
            .reschedule(&picked, now + chrono::Duration::seconds(60), Some(now), None, 0, None)
            .await?
    );

    let rescheduled = store.get_execution(&id).await?.unwrap();
    assert_eq!(rescheduled.version, 3);
    assert!(!rescheduled.picked);
    assert_eq!(rescheduled.picked_by, None);
    assert_eq!(rescheduled.last_heartbeat, None);
    assert_eq!(rescheduled.last_success, Some(now));

    // The old owner's handle is stale now.
    assert!(!store.remove(&picked).await?);
    assert!(store.remove(&rescheduled).await?);
    assert!(store.get_execution(&id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn get_due_orders_by_time_and_respects_limit() -> anyhow::Result<()> {
    let store = InMemoryExecutionStore::new();
    store.create_if_not_exists(execution("t", "late", -10)).await?;
    store.create_if_not_exists(execution("t", "early", -500)).await?;
    store.create_if_not_exists(execution("t", "middle", -200)).await?;
    store.create_if_not_exists(execution("t", "future", 60_000)).await?;

    let due = store.get_due(Utc::now(), 2).await?;
    let ids: Vec<&str> = due.iter().map(|e| e.instance_id.as_str()).collect();
    assert_eq!(ids, vec!["early", "middle"]);

    let all = store.get_due(Utc::now(), 10).await?;
    assert_eq!(all.len(), 3);
    Ok(())
}

#[tokio::test]
async fn pick_due_claims_a_bounded_batch() -> anyhow::Result<()> {
    let store = InMemoryExecutionStore::new();
    store.create_if_not_exists(execution("t", "a", -300)).await?;
    store.create_if_not_exists(execution("t", "b", -200)).await?;
    store.create_if_not_exists(execution("t", "c", -100)).await?;

    let picked = store.pick_due(Utc::now(), 2, "me").await?;
    assert_eq!(picked.len(), 2);
    assert!(picked.iter().all(|e| e.picked));
    assert!(picked.iter().all(|e| e.picked_by.as_deref() == Some("me")));
    assert_eq!(picked[0].instance_id, "a");
    assert_eq!(picked[1].instance_id, "b");

    // The remainder is still claimable.
    let rest = store.pick_due(Utc::now(), 10, "me").await?;
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].instance_id, "c");
    Ok(())
}

#[tokio::test]
async fn heartbeat_refreshes_stamp_without_bumping_version() -> anyhow::Result<()> {
    let store = InMemoryExecutionStore::new();
    store.create_if_not_exists(execution("t", "1", -10)).await?;

    let id = ExecutionId::new("t", "1");
    let created = store.get_execution(&id).await?.unwrap();
    let picked = store.pick(&created, Utc::now(), "a").await?.unwrap();

    let later = Utc::now() + chrono::Duration::seconds(30);
    store.update_heartbeat(&picked, later).await?;

    let row = store.get_execution(&id).await?.unwrap();
    assert_eq!(row.last_heartbeat, Some(later));
    assert_eq!(row.version, picked.version);

    // The owner's pending completion update is still valid.
    assert!(store.remove(&picked).await?);
    Ok(())
}

#[tokio::test]
async fn old_executions_are_only_picked_rows_with_stale_heartbeats() -> anyhow::Result<()> {
    let store = InMemoryExecutionStore::new();
    store.create_if_not_exists(execution("t", "stale", -10)).await?;
    store.create_if_not_exists(execution("t", "fresh", -10)).await?;
    store.create_if_not_exists(execution("t", "unpicked", -10)).await?;

    let long_ago = Utc::now() - chrono::Duration::minutes(30);
    let stale = store
        .get_execution(&ExecutionId::new("t", "stale"))
        .await?
        .unwrap();
    store.pick(&stale, long_ago, "dead-peer").await?.unwrap();

    let fresh = store
        .get_execution(&ExecutionId::new("t", "fresh"))
        .await?
        .unwrap();
    store.pick(&fresh, Utc::now(), "live-peer").await?.unwrap();

    let old = store
        .get_old_executions(Utc::now() - chrono::Duration::minutes(1))
        .await?;
    assert_eq!(old.len(), 1);
    assert_eq!(old[0].instance_id, "stale");
    Ok(())
}

#[tokio::test]
async fn failing_executions_diagnostic_filters_on_failures_and_window() -> anyhow::Result<()> {
    let store = InMemoryExecutionStore::new();
    store.create_if_not_exists(execution("t", "failing", -10)).await?;
    store.create_if_not_exists(execution("t", "healthy", -10)).await?;

    let id = ExecutionId::new("t", "failing");
    let row = store.get_execution(&id).await?.unwrap();
    let picked = store.pick(&row, Utc::now(), "a").await?.unwrap();
    let now = Utc::now();
    store
        .reschedule(
            &picked,
            now + chrono::Duration::seconds(60),
            None,
            Some(now),
            3,
            None,
        )
        .await?;

    let failing = store
        .get_failing_longer_than(Utc::now(), Duration::from_secs(1))
        .await?;
    assert_eq!(failing.len(), 1);
    assert_eq!(failing[0].instance_id, "failing");
    assert_eq!(failing[0].consecutive_failures, 3);
    Ok(())
}

#[tokio::test]
async fn update_payload_is_version_checked() -> anyhow::Result<()> {
    let store = InMemoryExecutionStore::new();
    store.create_if_not_exists(execution("t", "1", -10)).await?;

    let id = ExecutionId::new("t", "1");
    let row = store.get_execution(&id).await?.unwrap();

    assert!(store.update_payload(&row, Some(b"state-1".to_vec())).await?);
    // The previously observed version is stale now.
    assert!(!store.update_payload(&row, Some(b"state-2".to_vec())).await?);

    let row = store.get_execution(&id).await?.unwrap();
    assert_eq!(row.payload.as_deref(), Some(b"state-1".as_slice()));
    assert_eq!(row.version, 2);
    Ok(())
}
