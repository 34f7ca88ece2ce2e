//! Plan engine integration tests: dependency gating, plan counters, plan
//! terminal conditions, and the status cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use colony_core::agent::AgentRegistry;
use colony_core::error::ErrorKind;
use colony_core::event::{EventBus, EventType};
use colony_core::plan::PlanSpec;
use colony_core::task::StatusMeta;
use colony_core::Client;
use colony_db::models::{PlanStatus, SubTask, TaskStatus};
use colony_test_utils::{TestDb, create_test_db};
use uuid::Uuid;

async fn setup() -> (TestDb, Client, Arc<EventBus>) {
    let db = create_test_db().await;
    let bus = Arc::new(EventBus::new());
    let agents = Arc::new(AgentRegistry::new());
    let client = Client::new(db.pool.clone(), Arc::clone(&bus), agents);
    (db, client, bus)
}

fn subtask(id: &str, priority: i64, deps: &[&str]) -> SubTask {
    SubTask {
        id: id.to_string(),
        title: format!("Subtask {id}"),
        description: String::new(),
        task_type: "code".to_string(),
        priority,
        payload: None,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        estimated_duration: None,
    }
}

fn plan_spec(title: &str, subtasks: Vec<SubTask>) -> PlanSpec {
    PlanSpec {
        title: title.to_string(),
        description: String::new(),
        parent_task_id: None,
        subtasks,
    }
}

fn counter_for(bus: &EventBus, event_type: EventType) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let clone = Arc::clone(&counter);
    bus.subscribe(event_type, move |_| {
        clone.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    counter
}

/// Drive a materialized subtask to a terminal state through the legal path.
async fn finish_task(client: &Client, task_id: Uuid, outcome: TaskStatus) {
    client
        .update_task_status(
            task_id,
            TaskStatus::Assigned,
            Some(StatusMeta {
                assigned_worker: Some("test-driver".to_string()),
                ..StatusMeta::default()
            }),
        )
        .await
        .unwrap();
    client
        .update_task_status(task_id, TaskStatus::InProgress, None)
        .await
        .unwrap();
    client.update_task_status(task_id, outcome, None).await.unwrap();
}

#[tokio::test]
async fn dependency_gating_and_completion() {
    let (_db, client, bus) = setup().await;
    let plan_completed = counter_for(&bus, EventType::PlanCompleted);
    let subtask_ready = counter_for(&bus, EventType::PlanSubtaskReady);

    // A, then B after A, then C after A and B.
    let plan_id = client
        .create_execution_plan(plan_spec(
            "P",
            vec![
                subtask("a", 5, &[]),
                subtask("b", 5, &["a"]),
                subtask("c", 5, &["a", "b"]),
            ],
        ))
        .await
        .unwrap();

    let created = client.create_planned_subtasks_from_plan(plan_id).await.unwrap();
    assert_eq!(created, 3);

    // Idempotent re-invocation.
    let again = client.create_planned_subtasks_from_plan(plan_id).await.unwrap();
    assert_eq!(again, 0);

    client.mark_plan_execution_started(plan_id).await.unwrap();
    client.mark_plan_execution_started(plan_id).await.unwrap(); // idempotent
    assert_eq!(
        client.get_execution_plan_status(plan_id).await.unwrap(),
        Some(PlanStatus::InProgress)
    );

    let plan = client.get_execution_plan(plan_id).await.unwrap().unwrap();
    let mapping = plan.task_mapping.unwrap().0;
    let (a, b, c) = (mapping["a"], mapping["b"], mapping["c"]);

    // Only A is ready initially.
    let next = client.get_next_planned_subtask(plan_id).await.unwrap().unwrap();
    assert_eq!(next.id, a);
    assert!(!client.check_subtask_dependencies(b).await.unwrap());

    finish_task(&client, a, TaskStatus::Completed).await;
    let next = client.get_next_planned_subtask(plan_id).await.unwrap().unwrap();
    assert_eq!(next.id, b);

    // C still gated while B is in flight.
    client
        .update_task_status(
            b,
            TaskStatus::Assigned,
            Some(StatusMeta {
                assigned_worker: Some("test-driver".to_string()),
                ..StatusMeta::default()
            }),
        )
        .await
        .unwrap();
    client
        .update_task_status(b, TaskStatus::InProgress, None)
        .await
        .unwrap();
    assert!(!client.check_subtask_dependencies(c).await.unwrap());

    client
        .update_task_status(b, TaskStatus::Completed, None)
        .await
        .unwrap();
    assert!(client.check_subtask_dependencies(c).await.unwrap());

    let next = client.get_next_planned_subtask(plan_id).await.unwrap().unwrap();
    assert_eq!(next.id, c);
    finish_task(&client, c, TaskStatus::Completed).await;

    // Plan terminal bookkeeping.
    let plan = client.get_execution_plan(plan_id).await.unwrap().unwrap();
    assert_eq!(plan.completed_subtasks, 3);
    assert_eq!(plan.failed_subtasks, 0);
    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan_completed.load(Ordering::SeqCst), 1);
    assert!(subtask_ready.load(Ordering::SeqCst) >= 2, "b and c became ready");

    assert!(client.get_next_planned_subtask(plan_id).await.unwrap().is_none());
}

#[tokio::test]
async fn batch_dependency_check_matches_singles() {
    let (_db, client, _bus) = setup().await;

    let plan_id = client
        .create_execution_plan(plan_spec(
            "P",
            vec![subtask("a", 1, &[]), subtask("b", 1, &["a"])],
        ))
        .await
        .unwrap();
    client.create_planned_subtasks_from_plan(plan_id).await.unwrap();

    let plan = client.get_execution_plan(plan_id).await.unwrap().unwrap();
    let mapping = plan.task_mapping.unwrap().0;
    let (a, b) = (mapping["a"], mapping["b"]);

    let batch = client
        .check_subtask_dependencies_batch(&[a, b])
        .await
        .unwrap();
    assert_eq!(batch[&a], true);
    assert_eq!(batch[&b], false);
    assert_eq!(batch.len(), 2);
}

#[tokio::test]
async fn critical_path_failure_fails_the_plan() {
    let (_db, client, bus) = setup().await;
    let plan_failed = counter_for(&bus, EventType::PlanFailed);

    let plan_id = client
        .create_execution_plan(plan_spec(
            "P",
            vec![subtask("a", 1, &[]), subtask("b", 1, &["a"])],
        ))
        .await
        .unwrap();
    client.create_planned_subtasks_from_plan(plan_id).await.unwrap();
    client.mark_plan_execution_started(plan_id).await.unwrap();

    let plan = client.get_execution_plan(plan_id).await.unwrap().unwrap();
    let mapping = plan.task_mapping.unwrap().0;
    let (a, b) = (mapping["a"], mapping["b"]);

    // A fails with B depending on it: the plan sinks and B is cancelled.
    finish_task(&client, a, TaskStatus::Failed).await;

    let plan = client.get_execution_plan(plan_id).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Failed);
    assert_eq!(plan.completed_subtasks, 0);
    // Counter conservation: the failed root plus the cancelled dependent.
    assert_eq!(plan.failed_subtasks, 2);
    assert_eq!(plan_failed.load(Ordering::SeqCst), 1);

    let b_task = client.get_task(b).await.unwrap().unwrap();
    assert_eq!(b_task.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn leaf_failure_leaves_plan_running() {
    let (_db, client, _bus) = setup().await;

    let plan_id = client
        .create_execution_plan(plan_spec(
            "P",
            vec![subtask("a", 1, &[]), subtask("b", 1, &[])],
        ))
        .await
        .unwrap();
    client.create_planned_subtasks_from_plan(plan_id).await.unwrap();
    client.mark_plan_execution_started(plan_id).await.unwrap();

    let plan = client.get_execution_plan(plan_id).await.unwrap().unwrap();
    let mapping = plan.task_mapping.unwrap().0;

    // A failed leaf (nothing depends on it) does not sink the plan.
    finish_task(&client, mapping["a"], TaskStatus::Failed).await;

    let plan = client.get_execution_plan(plan_id).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::InProgress);
    assert_eq!(plan.failed_subtasks, 1);

    let b_task = client.get_task(mapping["b"]).await.unwrap().unwrap();
    assert_eq!(b_task.status, TaskStatus::Queued);
}

#[tokio::test]
async fn cached_status_invalidates_on_mutation() {
    let (_db, client, _bus) = setup().await;

    let plan_id = client
        .create_execution_plan(plan_spec("P", vec![subtask("a", 1, &[])]))
        .await
        .unwrap();

    assert_eq!(
        client.get_execution_plan_status_cached(plan_id).await.unwrap(),
        Some(PlanStatus::Pending)
    );

    // The plan.started event clears the cache, so the next cached read sees
    // the committed change.
    client.mark_plan_execution_started(plan_id).await.unwrap();
    assert_eq!(
        client.get_execution_plan_status_cached(plan_id).await.unwrap(),
        Some(PlanStatus::InProgress)
    );
}

#[tokio::test]
async fn plan_validation_errors() {
    let (_db, client, _bus) = setup().await;

    // Cycle.
    let err = client
        .create_execution_plan(plan_spec(
            "P",
            vec![subtask("a", 1, &["b"]), subtask("b", 1, &["a"])],
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    // Unknown dependency.
    let err = client
        .create_execution_plan(plan_spec("P", vec![subtask("a", 1, &["ghost"])]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);

    // Unknown plan.
    let err = client
        .create_planned_subtasks_from_plan(Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Starting a cancelled/terminal plan is a state error.
    let plan_id = client
        .create_execution_plan(plan_spec("Q", vec![subtask("a", 1, &[])]))
        .await
        .unwrap();
    client.create_planned_subtasks_from_plan(plan_id).await.unwrap();
    let plan = client.get_execution_plan(plan_id).await.unwrap().unwrap();
    finish_task(&client, plan.task_mapping.unwrap().0["a"], TaskStatus::Completed).await;
    let err = client.mark_plan_execution_started(plan_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateError);
}

#[tokio::test]
async fn planning_queue_roundtrip() {
    let (_db, client, bus) = setup().await;
    let requested = counter_for(&bus, EventType::PlanRequested);
    let generated = counter_for(&bus, EventType::PlanGenerated);

    let request_id = client
        .submit_planning_request("Break the login feature into steps", 50, Some("api"), None)
        .await
        .unwrap();
    assert_eq!(requested.load(Ordering::SeqCst), 1);

    client
        .plans()
        .assign_planning_request(request_id, "planner-agent")
        .await
        .unwrap();

    let plan_id = client
        .plans()
        .complete_planning_request(
            request_id,
            plan_spec("Login plan", vec![subtask("a", 1, &[])]),
        )
        .await
        .unwrap();
    assert_eq!(generated.load(Ordering::SeqCst), 1);

    let plan = client.get_execution_plan(plan_id).await.unwrap().unwrap();
    assert_eq!(plan.planning_task_id, Some(request_id));
}
