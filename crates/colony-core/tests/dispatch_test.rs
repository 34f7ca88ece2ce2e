//! Dispatch integration tests: the single-task happy path, priority
//! ordering, and claim exclusivity under concurrency.

use std::sync::{Arc, Mutex};

use colony_core::agent::AgentRegistry;
use colony_core::error::ErrorKind;
use colony_core::event::{Event, EventBus, EventType};
use colony_core::task::TaskSpec;
use colony_core::worker::RunOutcome;
use colony_core::Client;
use colony_db::models::{RunStatus, TaskStatus};
use colony_test_utils::{TestDb, create_test_db};

async fn setup() -> (TestDb, Client, Arc<EventBus>) {
    let db = create_test_db().await;
    let bus = Arc::new(EventBus::new());
    let agents = Arc::new(AgentRegistry::new());
    let client = Client::new(db.pool.clone(), Arc::clone(&bus), agents);
    (db, client, bus)
}

/// Record every published event of the given types.
fn record(bus: &EventBus, types: &[EventType]) -> Arc<Mutex<Vec<Event>>> {
    let sink: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
    for event_type in types {
        let sink = Arc::clone(&sink);
        bus.subscribe(*event_type, move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });
    }
    sink
}

#[tokio::test]
async fn single_task_happy_path() {
    let (_db, client, bus) = setup().await;
    let events = record(
        &bus,
        &[
            EventType::TaskCreated,
            EventType::TaskAssigned,
            EventType::RunStarted,
            EventType::RunCompleted,
            EventType::TaskStatusChanged,
        ],
    );

    let mut spec = TaskSpec::new("Review the release PR", "review");
    spec.priority = 5;
    let task_id = client.create_task(spec).await.unwrap();

    client
        .register_worker("w-1", "executor", vec!["review".to_string()], None)
        .await
        .unwrap();

    // Claim: task assigned, run allocated.
    let (task, run) = client
        .claim_task("w-1", Some("review"))
        .await
        .unwrap()
        .expect("claim should find the task");
    assert_eq!(task.id, task_id);
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assigned_worker.as_deref(), Some("w-1"));
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.run_number, 1);

    // Assignment coherence: the worker holds the task.
    let worker = client.get_worker("w-1").await.unwrap().unwrap();
    assert_eq!(worker.current_task_id, Some(task_id));

    // Execute: run running -> success, task in_progress -> completed.
    client.start_run(run.id).await.unwrap();
    client
        .update_task_status(task_id, TaskStatus::InProgress, None)
        .await
        .unwrap();
    client
        .complete_run(run.id, RunOutcome::success(Some(serde_json::json!({"ok": true}))))
        .await
        .unwrap();
    client
        .update_task_status(task_id, TaskStatus::Completed, None)
        .await
        .unwrap();

    let task = client.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.assigned_worker.is_none(), "terminal task holds no worker");

    let runs = client.get_runs_for_task(task_id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Success);
    assert!(runs[0].completed_at.is_some());

    let worker = client.get_worker("w-1").await.unwrap().unwrap();
    assert!(worker.current_task_id.is_none());

    // Event census: one of each lifecycle event, all on one correlation id.
    let events = events.lock().unwrap();
    let count = |t: EventType| events.iter().filter(|e| e.event_type == t).count();
    assert_eq!(count(EventType::TaskCreated), 1);
    assert_eq!(count(EventType::TaskAssigned), 1);
    assert_eq!(count(EventType::RunStarted), 1);
    assert_eq!(count(EventType::RunCompleted), 1);
    assert_eq!(count(EventType::TaskStatusChanged), 2); // in_progress, completed

    let correlation = &events[0].correlation_id;
    assert!(
        events.iter().all(|e| &e.correlation_id == correlation),
        "all lifecycle events share the task's correlation id"
    );
}

#[tokio::test]
async fn queued_tasks_order_by_priority_then_age() {
    let (_db, client, _bus) = setup().await;

    let mut low = TaskSpec::new("low", "code");
    low.priority = 1;
    let mut high = TaskSpec::new("high", "code");
    high.priority = 10;
    let mut mid = TaskSpec::new("mid", "code");
    mid.priority = 5;

    let _low = client.create_task(low).await.unwrap();
    let high_id = client.create_task(high).await.unwrap();
    let mid_id = client.create_task(mid).await.unwrap();

    let queued = client.get_queued_tasks(2, None).await.unwrap();
    assert_eq!(queued.len(), 2);
    assert_eq!(queued[0].id, high_id);
    assert_eq!(queued[1].id, mid_id);
}

#[tokio::test]
async fn concurrent_claims_get_distinct_tasks_or_none() {
    let (_db, client, _bus) = setup().await;

    let task_id = client
        .create_task(TaskSpec::new("contended", "code"))
        .await
        .unwrap();

    for worker in ["w-1", "w-2", "w-3", "w-4"] {
        client
            .register_worker(worker, "executor", vec![], None)
            .await
            .unwrap();
    }

    let (a, b, c, d) = tokio::join!(
        client.claim_task("w-1", None),
        client.claim_task("w-2", None),
        client.claim_task("w-3", None),
        client.claim_task("w-4", None),
    );

    let winners: Vec<_> = [a, b, c, d]
        .into_iter()
        .map(|r| r.expect("claim should not error"))
        .flatten()
        .collect();

    assert_eq!(winners.len(), 1, "exactly one claimant wins the task");
    assert_eq!(winners[0].0.id, task_id);
    assert_eq!(winners[0].1.run_number, 1);
}

#[tokio::test]
async fn worker_holding_a_task_cannot_claim_again() {
    let (_db, client, _bus) = setup().await;

    client.create_task(TaskSpec::new("one", "code")).await.unwrap();
    client.create_task(TaskSpec::new("two", "code")).await.unwrap();
    client
        .register_worker("w-1", "executor", vec![], None)
        .await
        .unwrap();

    client.claim_task("w-1", None).await.unwrap().expect("first claim");
    let err = client.claim_task("w-1", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn claim_from_unknown_worker_is_not_found() {
    let (_db, client, _bus) = setup().await;
    let err = client.claim_task("ghost", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn claim_filter_respects_task_type() {
    let (_db, client, _bus) = setup().await;

    client
        .create_task(TaskSpec::new("deploy it", "deploy"))
        .await
        .unwrap();
    client
        .register_worker("w-1", "executor", vec!["review".to_string()], None)
        .await
        .unwrap();

    let nothing = client.claim_task("w-1", Some("review")).await.unwrap();
    assert!(nothing.is_none());

    let claimed = client.claim_task("w-1", Some("deploy")).await.unwrap();
    assert!(claimed.is_some());
}
