//! Migration smoke tests: schema applies cleanly and is idempotent.

use colony_db::pool;
use colony_test_utils::create_test_db;

#[tokio::test]
async fn migrations_create_all_tables() {
    let db = create_test_db().await;

    let counts = pool::table_counts(&db.pool)
        .await
        .expect("table counts should succeed");
    let names: Vec<&str> = counts.iter().map(|(name, _)| name.as_str()).collect();

    for expected in [
        "tasks",
        "task_dependencies",
        "runs",
        "workers",
        "planning_queue",
        "execution_plans",
        "plan_execution",
        "unified_tasks",
        "unified_workflow_tasks",
        "unified_review_tasks",
        "unified_deployment_tasks",
    ] {
        assert!(names.contains(&expected), "missing table {expected}");
    }

    // Fresh database: everything empty.
    for (name, count) in &counts {
        assert_eq!(*count, 0, "table {name} should start empty");
    }
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let db = create_test_db().await;

    // Re-running the migrator against an up-to-date database is a no-op.
    pool::run_migrations(&db.pool, pool::default_migrations_path())
        .await
        .expect("second migration run should succeed");
}

#[tokio::test]
async fn required_indices_exist() {
    let db = create_test_db().await;

    let indices: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'",
    )
    .fetch_all(&db.pool)
    .await
    .expect("index query should succeed");
    let names: Vec<&str> = indices.iter().map(|(name,)| name.as_str()).collect();

    for expected in [
        "idx_tasks_status",
        "idx_tasks_priority",
        "idx_tasks_plan_id",
        "idx_runs_task_id",
        "idx_runs_worker_id",
        "idx_workers_status",
        "idx_workers_role",
        "idx_execution_plans_status",
        "idx_unified_tasks_correlation_id",
    ] {
        assert!(names.contains(&expected), "missing index {expected}");
    }
}
