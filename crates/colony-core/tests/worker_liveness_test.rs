//! Liveness and redelivery tests: worker death, the sweep, and unregister.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use colony_core::agent::AgentRegistry;
use colony_core::event::EventBus;
use colony_core::task::TaskSpec;
use colony_core::{Client, ClientOptions};
use colony_db::models::{RunStatus, TaskStatus, WorkerStatus};
use colony_test_utils::{TestDb, create_test_db};

async fn setup(heartbeat_timeout: Duration) -> (TestDb, Client) {
    let db = create_test_db().await;
    let bus = Arc::new(EventBus::new());
    let agents = Arc::new(AgentRegistry::new());
    let client = Client::with_options(
        db.pool.clone(),
        bus,
        agents,
        ClientOptions {
            dual_write: false,
            heartbeat_timeout,
        },
    );
    (db, client)
}

#[tokio::test]
async fn dead_worker_task_is_redelivered() {
    let (_db, client) = setup(Duration::from_millis(100)).await;

    let task_id = client
        .create_task(TaskSpec::new("important", "code"))
        .await
        .unwrap();
    client
        .register_worker("w-1", "executor", vec![], None)
        .await
        .unwrap();

    let (_, run1) = client.claim_task("w-1", None).await.unwrap().unwrap();
    client.start_run(run1.id).await.unwrap();

    // w-1 stops heartbeating; let the timeout lapse, then sweep.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let offlined = client.workers().sweep_stale_workers().await.unwrap();
    assert_eq!(offlined, vec!["w-1".to_string()]);

    let worker = client.get_worker("w-1").await.unwrap().unwrap();
    assert_eq!(worker.status, WorkerStatus::Offline);
    assert!(worker.current_task_id.is_none());

    let task = client.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.assigned_worker.is_none());

    // The orphaned run must not stay running.
    let run1 = client.workers().get_run(run1.id).await.unwrap().unwrap();
    assert_eq!(run1.status, RunStatus::Cancelled);
    assert!(run1.completed_at.is_some());

    // A second worker picks the task up with the next run number.
    client
        .register_worker("w-2", "executor", vec![], None)
        .await
        .unwrap();
    let (task, run2) = client.claim_task("w-2", None).await.unwrap().unwrap();
    assert_eq!(task.id, task_id);
    assert_eq!(run2.run_number, 2);
}

#[tokio::test]
async fn background_sweeper_runs_until_cancelled() {
    let (_db, client) = setup(Duration::from_millis(50)).await;

    client
        .register_worker("w-1", "executor", vec![], None)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let handle = client.spawn_liveness_sweeper(Duration::from_millis(50), cancel.clone());

    // Eventually the sweeper takes the silent worker offline.
    let mut offline = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let worker = client.get_worker("w-1").await.unwrap().unwrap();
        if worker.status == WorkerStatus::Offline {
            offline = true;
            break;
        }
    }
    assert!(offline, "sweeper should mark the silent worker offline");

    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn fresh_heartbeat_survives_the_sweep() {
    let (_db, client) = setup(Duration::from_secs(60)).await;

    client
        .register_worker("w-1", "executor", vec![], None)
        .await
        .unwrap();
    assert!(client.update_worker_heartbeat("w-1", None).await.unwrap());

    let offlined = client.workers().sweep_stale_workers().await.unwrap();
    assert!(offlined.is_empty());

    let active = client.get_active_workers(None).await.unwrap();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn heartbeat_does_not_register_implicitly() {
    let (_db, client) = setup(Duration::from_secs(60)).await;
    assert!(!client.update_worker_heartbeat("ghost", None).await.unwrap());
    assert!(client.get_worker("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn reregistration_is_idempotent() {
    let (_db, client) = setup(Duration::from_secs(60)).await;

    client
        .register_worker("w-1", "executor", vec!["code".to_string()], None)
        .await
        .unwrap();
    client
        .register_worker("w-1", "executor", vec!["code".to_string()], None)
        .await
        .unwrap();

    let active = client.get_active_workers(Some("executor")).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].capabilities.0, vec!["code".to_string()]);
}

#[tokio::test]
async fn unregister_requeues_held_task() {
    let (_db, client) = setup(Duration::from_secs(60)).await;

    let task_id = client
        .create_task(TaskSpec::new("held", "code"))
        .await
        .unwrap();
    client
        .register_worker("w-1", "executor", vec![], None)
        .await
        .unwrap();
    let (_, run) = client.claim_task("w-1", None).await.unwrap().unwrap();

    assert!(client.unregister_worker("w-1").await.unwrap());
    assert!(client.get_worker("w-1").await.unwrap().is_none());

    let task = client.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.assigned_worker.is_none());

    let run = client.workers().get_run(run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);

    // Unknown id reports false rather than erroring.
    assert!(!client.unregister_worker("w-1").await.unwrap());
}
