//! Worker service: registration, heartbeat liveness, claim dispatch, and
//! run lifecycle.
//!
//! Claiming is a single-statement atomic pick (two concurrent claimants can
//! never both receive the same task) plus run allocation and worker
//! bookkeeping in one transaction. A background sweeper marks silent workers
//! offline and requeues whatever they held (at-least-once redelivery).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use colony_db::models::{Run, RunStatus, Task, Worker, WorkerStatus};
use colony_db::queries::{runs as run_db, tasks as task_db, workers as worker_db};

use crate::error::{Error, Result};
use crate::event::{Event, EventBus, EventType};
use crate::task::TaskRepository;

/// Default maximum heartbeat age before a worker is considered offline.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Terminal outcome of a run, recorded by [`WorkerService::complete_run`].
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub result_data: Option<Value>,
    pub error_message: Option<String>,
    pub output_log: Option<String>,
}

impl RunOutcome {
    pub fn success(result_data: Option<Value>) -> Self {
        Self {
            status: RunStatus::Success,
            result_data,
            error_message: None,
            output_log: None,
        }
    }

    pub fn failure(error_message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failure,
            result_data: None,
            error_message: Some(error_message.into()),
            output_log: None,
        }
    }
}

/// Register, heartbeat, claim, and sweep workers.
#[derive(Clone)]
pub struct WorkerService {
    tasks: TaskRepository,
    bus: Arc<EventBus>,
    heartbeat_timeout: Duration,
}

impl WorkerService {
    pub fn new(tasks: TaskRepository, bus: Arc<EventBus>) -> Self {
        Self {
            tasks,
            bus,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    fn pool(&self) -> &sqlx::SqlitePool {
        self.tasks.pool()
    }

    fn heartbeat_cutoff(&self) -> chrono::DateTime<Utc> {
        Utc::now()
            - chrono::Duration::from_std(self.heartbeat_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    /// Register (or re-register) a worker. Upsert on id: re-registration
    /// replaces role, capabilities, and metadata, and resets the heartbeat.
    ///
    /// Emits `worker.registered`.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        role: &str,
        capabilities: Vec<String>,
        metadata: Option<Value>,
    ) -> Result<()> {
        if worker_id.trim().is_empty() {
            return Err(Error::Validation("worker id must not be empty".into()));
        }
        if role.trim().is_empty() {
            return Err(Error::Validation("worker role must not be empty".into()));
        }

        let worker = worker_db::upsert_worker(
            self.pool(),
            worker_id,
            role,
            &capabilities,
            metadata.as_ref(),
            Utc::now(),
        )
        .await?;

        tracing::info!(worker_id = %worker_id, role = %role, "registered worker");
        self.bus.publish(Event::new(
            EventType::WorkerRegistered,
            worker_id.to_string(),
            serde_json::json!({
                "worker_id": worker.id,
                "role": worker.role,
                "capabilities": worker.capabilities.0,
            }),
        ));
        Ok(())
    }

    /// Refresh a worker's heartbeat, optionally updating its status.
    ///
    /// Returns `false` for an unknown id -- heartbeats never register
    /// implicitly. Emits `worker.heartbeat` on success.
    pub async fn update_worker_heartbeat(
        &self,
        worker_id: &str,
        status: Option<WorkerStatus>,
    ) -> Result<bool> {
        let rows = worker_db::touch_heartbeat(self.pool(), worker_id, status, Utc::now()).await?;
        if rows == 0 {
            tracing::warn!(worker_id = %worker_id, "heartbeat from unknown worker");
            return Ok(false);
        }

        self.bus.publish(Event::new(
            EventType::WorkerHeartbeat,
            worker_id.to_string(),
            serde_json::json!({
                "worker_id": worker_id,
                "status": status,
            }),
        ));
        Ok(true)
    }

    /// Fetch a worker snapshot.
    pub async fn get_worker(&self, worker_id: &str) -> Result<Option<Worker>> {
        Ok(worker_db::get_worker(self.pool(), worker_id).await?)
    }

    /// Workers with `status = active` and a fresh heartbeat.
    pub async fn get_active_workers(&self, role: Option<&str>) -> Result<Vec<Worker>> {
        Ok(worker_db::list_active_workers(self.pool(), role, self.heartbeat_cutoff()).await?)
    }

    /// Claim the highest-priority ready queued task for a worker.
    ///
    /// On success the task is `assigned` to the worker and a fresh `pending`
    /// run with the next `run_number` exists; both plus the worker's
    /// `current_task_id` are written in one transaction. Returns `None` when
    /// nothing claimable matches.
    ///
    /// `capability_filter` matches `task_type` equality or tag membership
    /// (deterministic; see the dispatch rule in the crate docs).
    ///
    /// Emits `task.assigned`. Errors: `not_found` (unknown worker),
    /// `conflict` (worker already holds a task or is not claimable).
    pub async fn claim(
        &self,
        worker_id: &str,
        capability_filter: Option<&str>,
    ) -> Result<Option<(Task, Run)>> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let worker = worker_db::get_worker(&mut *tx, worker_id)
            .await?
            .ok_or_else(|| Error::not_found("worker", worker_id))?;

        if worker.current_task_id.is_some() {
            return Err(Error::Conflict(format!(
                "worker {worker_id} already holds task {:?}",
                worker.current_task_id
            )));
        }
        if !matches!(worker.status, WorkerStatus::Active | WorkerStatus::Idle) {
            return Err(Error::Conflict(format!(
                "worker {worker_id} is {} and cannot claim",
                worker.status
            )));
        }

        // Claiming is itself proof of life.
        worker_db::touch_heartbeat(&mut *tx, worker_id, None, now).await?;

        let Some(task) =
            task_db::claim_next_ready(&mut *tx, worker_id, capability_filter, now).await?
        else {
            tx.commit().await?;
            return Ok(None);
        };

        let run = run_db::insert_run(&mut *tx, Uuid::new_v4(), task.id, worker_id, now).await?;
        worker_db::set_current_task(&mut *tx, worker_id, Some(task.id), now).await?;
        self.tasks.mirror_conn(&mut *tx, &task).await?;

        tx.commit().await?;

        tracing::info!(
            task_id = %task.id,
            worker_id = %worker_id,
            run_number = run.run_number,
            "task claimed"
        );
        self.bus.publish(Event::new(
            EventType::TaskAssigned,
            task.correlation_id.clone(),
            serde_json::json!({
                "task_id": task.id,
                "worker_id": worker_id,
                "run_id": run.id,
                "run_number": run.run_number,
            }),
        ));

        Ok(Some((task, run)))
    }

    /// Remove a worker. A held task goes back to `queued` (redelivery) and
    /// its open run is cancelled. Returns `false` for an unknown id.
    pub async fn unregister_worker(&self, worker_id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let Some(worker) = worker_db::get_worker(&mut *tx, worker_id).await? else {
            return Ok(false);
        };

        let mut requeued = None;
        if let Some(task_id) = worker.current_task_id {
            task_db::requeue_task(&mut *tx, task_id, now).await?;
            run_db::cancel_open_runs_for_task(&mut *tx, task_id, "worker unregistered", now)
                .await?;
            if let Some(task) = task_db::get_task(&mut *tx, task_id).await? {
                self.tasks.mirror_conn(&mut *tx, &task).await?;
                requeued = Some(task);
            }
        }

        worker_db::delete_worker(&mut *tx, worker_id).await?;
        tx.commit().await?;

        tracing::info!(worker_id = %worker_id, "unregistered worker");
        if let Some(task) = requeued {
            self.bus.publish(Event::new(
                EventType::TaskStatusChanged,
                task.correlation_id.clone(),
                serde_json::json!({
                    "task_id": task.id,
                    "from": "assigned",
                    "to": "queued",
                    "reason": "worker unregistered",
                }),
            ));
        }
        Ok(true)
    }

    /// Mark every worker with a stale heartbeat `offline`, requeueing held
    /// tasks. Returns the ids of the workers taken offline.
    pub async fn sweep_stale_workers(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let cutoff = self.heartbeat_cutoff();
        let mut tx = self.pool().begin().await?;

        let stale = worker_db::list_stale_workers(&mut *tx, cutoff).await?;
        let mut events = Vec::new();
        let mut offlined = Vec::new();

        for worker in &stale {
            worker_db::mark_offline(&mut *tx, &worker.id).await?;
            offlined.push(worker.id.clone());
            events.push(Event::new(
                EventType::WorkerOffline,
                worker.id.clone(),
                serde_json::json!({
                    "worker_id": worker.id,
                    "last_heartbeat": worker.last_heartbeat,
                }),
            ));

            if let Some(task_id) = worker.current_task_id {
                task_db::requeue_task(&mut *tx, task_id, now).await?;
                run_db::cancel_open_runs_for_task(&mut *tx, task_id, "worker offline", now)
                    .await?;
                if let Some(task) = task_db::get_task(&mut *tx, task_id).await? {
                    self.tasks.mirror_conn(&mut *tx, &task).await?;
                    events.push(Event::new(
                        EventType::TaskStatusChanged,
                        task.correlation_id.clone(),
                        serde_json::json!({
                            "task_id": task.id,
                            "from": "assigned",
                            "to": "queued",
                            "reason": "worker offline",
                        }),
                    ));
                }
            }
        }

        tx.commit().await?;

        for worker_id in &offlined {
            tracing::warn!(worker_id = %worker_id, "worker heartbeat stale, marked offline");
        }
        for event in events {
            self.bus.publish(event);
        }
        Ok(offlined)
    }

    /// Spawn the background liveness sweep on the given interval.
    ///
    /// The task runs until the cancellation token fires; sweep failures are
    /// logged and the loop keeps going.
    pub fn spawn_liveness_sweeper(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("liveness sweeper stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = service.sweep_stale_workers().await {
                            tracing::error!(error = %e, "liveness sweep failed");
                        }
                    }
                }
            }
        })
    }

    // -------------------------------------------------------------------
    // Run lifecycle
    // -------------------------------------------------------------------

    /// Fetch a run snapshot.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(run_db::get_run(self.pool(), run_id).await?)
    }

    /// All runs of a task in run-number order.
    pub async fn get_runs_for_task(&self, task_id: Uuid) -> Result<Vec<Run>> {
        Ok(run_db::list_runs_for_task(self.pool(), task_id).await?)
    }

    /// Start a claimed run: `pending -> running`. Emits `run.started`.
    pub async fn start_run(&self, run_id: Uuid) -> Result<()> {
        let run = run_db::get_run(self.pool(), run_id)
            .await?
            .ok_or_else(|| Error::not_found("run", run_id))?;

        let rows = run_db::transition_run_status(
            self.pool(),
            run_id,
            RunStatus::Pending,
            RunStatus::Running,
            None,
        )
        .await?;
        if rows == 0 {
            return Err(Error::State(format!(
                "run {run_id} is {} (expected pending)",
                run.status
            )));
        }

        let correlation = self.run_correlation(&run).await?;
        self.bus.publish(Event::new(
            EventType::RunStarted,
            correlation,
            serde_json::json!({
                "run_id": run_id,
                "task_id": run.task_id,
                "worker_id": run.worker_id,
                "run_number": run.run_number,
            }),
        ));
        Ok(())
    }

    /// Record a run's terminal outcome and release the worker.
    ///
    /// Emits `run.completed` on success, `run.failed` otherwise. Errors:
    /// `validation_error` (non-terminal outcome status), `state_error`
    /// (run already terminal with a different status). Completing twice with
    /// the same status is a no-op.
    pub async fn complete_run(&self, run_id: Uuid, outcome: RunOutcome) -> Result<()> {
        if !outcome.status.is_terminal() {
            return Err(Error::Validation(format!(
                "run outcome status {} is not terminal",
                outcome.status
            )));
        }

        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let run = run_db::get_run(&mut *tx, run_id)
            .await?
            .ok_or_else(|| Error::not_found("run", run_id))?;

        if run.status == outcome.status {
            return Ok(());
        }
        if run.status.is_terminal() {
            return Err(Error::State(format!(
                "run {run_id} already ended as {}",
                run.status
            )));
        }

        let rows =
            run_db::transition_run_status(&mut *tx, run_id, run.status, outcome.status, Some(now))
                .await?;
        if rows == 0 {
            return Err(Error::Conflict(format!(
                "run {run_id} was concurrently moved out of {}",
                run.status
            )));
        }

        run_db::set_run_outcome(
            &mut *tx,
            run_id,
            outcome.result_data.as_ref(),
            outcome.error_message.as_deref(),
            outcome.output_log.as_deref(),
        )
        .await?;

        tx.commit().await?;

        let correlation = self.run_correlation(&run).await?;
        let event_type = match outcome.status {
            RunStatus::Success => EventType::RunCompleted,
            _ => EventType::RunFailed,
        };
        self.bus.publish(Event::new(
            event_type,
            correlation,
            serde_json::json!({
                "run_id": run_id,
                "task_id": run.task_id,
                "run_number": run.run_number,
                "status": outcome.status,
                "error_message": outcome.error_message,
            }),
        ));
        Ok(())
    }

    /// Correlation id of the run's owning task (falls back to the task id).
    async fn run_correlation(&self, run: &Run) -> Result<String> {
        Ok(task_db::get_task(self.pool(), run.task_id)
            .await?
            .map(|t| t.correlation_id)
            .unwrap_or_else(|| run.task_id.to_string()))
    }
}
