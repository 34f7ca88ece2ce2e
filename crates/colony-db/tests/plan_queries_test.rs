//! Integration tests for plan queries: plan CRUD, counters, the progress
//! row, and the planning queue.

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use colony_db::models::{PlanStatus, PlanningStatus, SubTask};
use colony_db::queries::plans::{self as db, NewExecutionPlan};
use colony_test_utils::create_test_db;

fn subtask(id: &str, deps: &[&str]) -> SubTask {
    SubTask {
        id: id.to_string(),
        title: format!("Subtask {id}"),
        description: String::new(),
        task_type: "code".to_string(),
        priority: 1,
        payload: None,
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        estimated_duration: None,
    }
}

fn new_plan(title: &str, subtasks: Vec<SubTask>) -> NewExecutionPlan {
    let mut graph = HashMap::new();
    for sub in &subtasks {
        graph.insert(sub.id.clone(), sub.dependencies.clone());
    }
    NewExecutionPlan {
        id: Uuid::new_v4(),
        planning_task_id: None,
        title: title.to_string(),
        description: String::new(),
        parent_task_id: None,
        subtasks,
        dependency_graph: graph,
    }
}

#[tokio::test]
async fn insert_and_fetch_plan() {
    let db = create_test_db().await;

    let new = new_plan("P", vec![subtask("a", &[]), subtask("b", &["a"])]);
    let plan = db::insert_execution_plan(&db.pool, &new, Utc::now())
        .await
        .unwrap();

    assert_eq!(plan.status, PlanStatus::Pending);
    assert_eq!(plan.total_subtasks, 2);
    assert_eq!(plan.completed_subtasks, 0);
    assert!(plan.task_mapping.is_none());

    let status = db::get_plan_status(&db.pool, new.id).await.unwrap();
    assert_eq!(status, Some(PlanStatus::Pending));
}

#[tokio::test]
async fn counters_and_transitions() {
    let db = create_test_db().await;
    let new = new_plan("P", vec![subtask("a", &[])]);
    db::insert_execution_plan(&db.pool, &new, Utc::now())
        .await
        .unwrap();

    db::increment_plan_counter(&db.pool, new.id, true, Utc::now())
        .await
        .unwrap();
    db::increment_plan_counter(&db.pool, new.id, false, Utc::now())
        .await
        .unwrap();
    db::add_failed_subtasks(&db.pool, new.id, 2, Utc::now())
        .await
        .unwrap();

    let plan = db::get_execution_plan(&db.pool, new.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plan.completed_subtasks, 1);
    assert_eq!(plan.failed_subtasks, 3);

    let rows = db::transition_plan_status(
        &db.pool,
        new.id,
        PlanStatus::Pending,
        PlanStatus::InProgress,
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 1);

    // Stale expectation loses.
    let rows = db::transition_plan_status(
        &db.pool,
        new.id,
        PlanStatus::Pending,
        PlanStatus::InProgress,
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn task_mapping_records_materialization() {
    let db = create_test_db().await;
    let new = new_plan("P", vec![subtask("a", &[])]);
    db::insert_execution_plan(&db.pool, &new, Utc::now())
        .await
        .unwrap();

    let mut mapping = HashMap::new();
    mapping.insert("a".to_string(), Uuid::new_v4());
    db::set_task_mapping(&db.pool, new.id, &mapping, Utc::now())
        .await
        .unwrap();

    let plan = db::get_execution_plan(&db.pool, new.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plan.task_mapping.unwrap().0, mapping);
}

#[tokio::test]
async fn plan_execution_row_upserts_once() {
    let db = create_test_db().await;
    let new = new_plan("P", vec![subtask("a", &[])]);
    db::insert_execution_plan(&db.pool, &new, Utc::now())
        .await
        .unwrap();

    let rows = db::insert_plan_execution(&db.pool, Uuid::new_v4(), new.id, Utc::now())
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Second insert is a no-op thanks to the plan_id uniqueness.
    let rows = db::insert_plan_execution(&db.pool, Uuid::new_v4(), new.id, Utc::now())
        .await
        .unwrap();
    assert_eq!(rows, 0);

    db::update_plan_execution(
        &db.pool,
        new.id,
        "execution",
        50,
        &["a".to_string()],
        &[],
        &[],
        &[],
        None,
        Utc::now(),
    )
    .await
    .unwrap();

    let exec = db::get_plan_execution(&db.pool, new.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exec.progress_percent, 50);
    assert_eq!(exec.active_subtasks.0, vec!["a".to_string()]);
    assert!(exec.completed_at.is_none());
}

#[tokio::test]
async fn planning_queue_lifecycle() {
    let db = create_test_db().await;

    let id = Uuid::new_v4();
    let request = db::insert_planning_request(
        &db.pool,
        id,
        "Break down the login feature",
        50,
        Some("api"),
        None,
        Utc::now(),
    )
    .await
    .unwrap();
    assert_eq!(request.status, PlanningStatus::Pending);

    let rows = db::assign_planning_request(&db.pool, id, "planner-agent", Utc::now())
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Assigning twice loses the optimistic check.
    let rows = db::assign_planning_request(&db.pool, id, "other-agent", Utc::now())
        .await
        .unwrap();
    assert_eq!(rows, 0);

    let rows = db::complete_planning_request(&db.pool, id, Utc::now())
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let request = db::get_planning_request(&db.pool, id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, PlanningStatus::Completed);
    assert!(request.completed_at.is_some());
    assert_eq!(request.assigned_agent.as_deref(), Some("planner-agent"));
}
