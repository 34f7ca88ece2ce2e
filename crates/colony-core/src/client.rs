//! Client facade: the stable, typed operation surface over the core.
//!
//! Construction is explicit (pool, bus, agent registry in; no globals, no
//! import-time side effects). The facade adds argument validation and
//! correlation-id defaulting; business logic lives in the services it wraps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use colony_db::models::{
    ExecutionPlan, PlanStatus, Run, Task, TaskStatus, Worker, WorkerStatus,
};

use crate::agent::{AgentHealth, AgentRegistry, RegistryStats};
use crate::error::Result;
use crate::event::EventBus;
use crate::plan::{PlanEngine, PlanSpec};
use crate::task::{StatusMeta, TaskRepository, TaskSpec};
use crate::worker::{RunOutcome, WorkerService};
use crate::workflow::{DEFAULT_MAX_ITERATIONS, WorkflowExecutor, WorkflowState};

/// Tunables applied at construction.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Mirror every task mutation into the unified migration schema.
    pub dual_write: bool,
    /// Maximum heartbeat age before a worker counts as offline.
    pub heartbeat_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            dual_write: false,
            heartbeat_timeout: crate::worker::DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

/// High-level client for orchestration operations.
#[derive(Clone)]
pub struct Client {
    bus: Arc<EventBus>,
    agents: Arc<AgentRegistry>,
    tasks: TaskRepository,
    workers: WorkerService,
    plans: PlanEngine,
    workflows: WorkflowExecutor,
}

impl Client {
    pub fn new(pool: SqlitePool, bus: Arc<EventBus>, agents: Arc<AgentRegistry>) -> Self {
        Self::with_options(pool, bus, agents, ClientOptions::default())
    }

    pub fn with_options(
        pool: SqlitePool,
        bus: Arc<EventBus>,
        agents: Arc<AgentRegistry>,
        options: ClientOptions,
    ) -> Self {
        let tasks = TaskRepository::new(pool, Arc::clone(&bus), options.dual_write);
        let workers = WorkerService::new(tasks.clone(), Arc::clone(&bus))
            .with_heartbeat_timeout(options.heartbeat_timeout);
        let plans = PlanEngine::new(tasks.clone(), Arc::clone(&bus));
        let workflows =
            WorkflowExecutor::new(tasks.clone(), Arc::clone(&agents), Arc::clone(&bus));

        Self {
            bus,
            agents,
            tasks,
            workers,
            plans,
            workflows,
        }
    }

    // -------------------------------------------------------------------
    // Component access
    // -------------------------------------------------------------------

    pub fn get_event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn agent_registry(&self) -> Arc<AgentRegistry> {
        Arc::clone(&self.agents)
    }

    pub fn tasks(&self) -> &TaskRepository {
        &self.tasks
    }

    pub fn workers(&self) -> &WorkerService {
        &self.workers
    }

    pub fn plans(&self) -> &PlanEngine {
        &self.plans
    }

    pub fn workflows(&self) -> &WorkflowExecutor {
        &self.workflows
    }

    // -------------------------------------------------------------------
    // Task operations
    // -------------------------------------------------------------------

    pub async fn create_task(&self, spec: TaskSpec) -> Result<Uuid> {
        self.tasks.create_task(spec).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>> {
        self.tasks.get_task(task_id).await
    }

    pub async fn update_task_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        meta: Option<StatusMeta>,
    ) -> Result<()> {
        self.tasks.update_task_status(task_id, status, meta).await
    }

    pub async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.tasks.get_tasks_by_status(status).await
    }

    pub async fn get_queued_tasks(
        &self,
        limit: i64,
        task_type: Option<&str>,
    ) -> Result<Vec<Task>> {
        self.tasks.get_queued_tasks(limit, task_type).await
    }

    pub async fn cancel_task(&self, task_id: Uuid, reason: Option<&str>) -> Result<()> {
        self.tasks.cancel_task(task_id, reason).await
    }

    pub async fn delete_task(&self, task_id: Uuid, force: bool) -> Result<()> {
        self.tasks.delete_task(task_id, force).await
    }

    /// Switch off legacy-schema mirroring (post-migration control).
    pub fn disable_dual_write(&self) {
        self.tasks.disable_dual_write();
    }

    // -------------------------------------------------------------------
    // Worker operations
    // -------------------------------------------------------------------

    pub async fn register_worker(
        &self,
        worker_id: &str,
        role: &str,
        capabilities: Vec<String>,
        metadata: Option<Value>,
    ) -> Result<()> {
        self.workers
            .register_worker(worker_id, role, capabilities, metadata)
            .await
    }

    pub async fn update_worker_heartbeat(
        &self,
        worker_id: &str,
        status: Option<WorkerStatus>,
    ) -> Result<bool> {
        self.workers.update_worker_heartbeat(worker_id, status).await
    }

    pub async fn get_active_workers(&self, role: Option<&str>) -> Result<Vec<Worker>> {
        self.workers.get_active_workers(role).await
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Option<Worker>> {
        self.workers.get_worker(worker_id).await
    }

    pub async fn unregister_worker(&self, worker_id: &str) -> Result<bool> {
        self.workers.unregister_worker(worker_id).await
    }

    pub async fn claim_task(
        &self,
        worker_id: &str,
        capability_filter: Option<&str>,
    ) -> Result<Option<(Task, Run)>> {
        self.workers.claim(worker_id, capability_filter).await
    }

    pub async fn start_run(&self, run_id: Uuid) -> Result<()> {
        self.workers.start_run(run_id).await
    }

    pub async fn complete_run(&self, run_id: Uuid, outcome: RunOutcome) -> Result<()> {
        self.workers.complete_run(run_id, outcome).await
    }

    pub async fn get_runs_for_task(&self, task_id: Uuid) -> Result<Vec<Run>> {
        self.workers.get_runs_for_task(task_id).await
    }

    /// Spawn the background worker-liveness sweep.
    pub fn spawn_liveness_sweeper(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        self.workers.spawn_liveness_sweeper(interval, cancel)
    }

    // -------------------------------------------------------------------
    // Plan operations
    // -------------------------------------------------------------------

    pub async fn create_execution_plan(&self, spec: PlanSpec) -> Result<Uuid> {
        self.plans.create_execution_plan(spec).await
    }

    pub async fn get_execution_plan(&self, plan_id: Uuid) -> Result<Option<ExecutionPlan>> {
        self.plans.get_execution_plan(plan_id).await
    }

    pub async fn create_planned_subtasks_from_plan(&self, plan_id: Uuid) -> Result<u64> {
        self.plans.create_planned_subtasks_from_plan(plan_id).await
    }

    pub async fn get_execution_plan_status(&self, plan_id: Uuid) -> Result<Option<PlanStatus>> {
        self.plans.get_execution_plan_status(plan_id).await
    }

    pub async fn get_execution_plan_status_cached(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<PlanStatus>> {
        self.plans.get_execution_plan_status_cached(plan_id).await
    }

    pub async fn check_subtask_dependencies(&self, task_id: Uuid) -> Result<bool> {
        self.plans.check_subtask_dependencies(task_id).await
    }

    pub async fn check_subtask_dependencies_batch(
        &self,
        task_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, bool>> {
        self.plans.check_subtask_dependencies_batch(task_ids).await
    }

    pub async fn get_next_planned_subtask(&self, plan_id: Uuid) -> Result<Option<Task>> {
        self.plans.get_next_planned_subtask(plan_id).await
    }

    pub async fn mark_plan_execution_started(&self, plan_id: Uuid) -> Result<()> {
        self.plans.mark_plan_execution_started(plan_id).await
    }

    pub async fn submit_planning_request(
        &self,
        task_description: &str,
        priority: i64,
        requestor: Option<&str>,
        context_data: Option<Value>,
    ) -> Result<Uuid> {
        self.plans
            .submit_planning_request(task_description, priority, requestor, context_data)
            .await
    }

    // -------------------------------------------------------------------
    // Workflow operations
    // -------------------------------------------------------------------

    pub async fn create_chimera_task(
        &self,
        feature_description: &str,
        target_url: &str,
        staging_url: Option<&str>,
        priority: i64,
    ) -> Result<Uuid> {
        self.workflows
            .create_chimera_task(feature_description, target_url, staging_url, priority)
            .await
    }

    pub async fn execute_workflow(
        &self,
        task_id: Uuid,
        max_iterations: Option<u32>,
    ) -> Result<WorkflowState> {
        self.workflows
            .execute_workflow(task_id, max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS))
            .await
    }

    // -------------------------------------------------------------------
    // Agent operations
    // -------------------------------------------------------------------

    pub async fn health_check_agents(&self) -> HashMap<String, AgentHealth> {
        self.agents.health_check_all().await
    }

    pub fn agent_stats(&self) -> RegistryStats {
        self.agents.stats()
    }
}
