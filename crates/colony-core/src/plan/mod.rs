//! Plan engine: materializes execution plans into dependency-gated tasks and
//! answers the "next ready subtask" question.
//!
//! Plans arrive from a planner agent (via the planning queue or directly),
//! are validated for graph soundness, and are materialized transactionally:
//! one task per subtask, dependency edges translated through a stable
//! subtask-id to task-id mapping.

pub mod progress;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use colony_db::models::{ExecutionPlan, PlanStatus, SubTask, Task};
use colony_db::queries::plans as plan_db;
use colony_db::queries::plans::NewExecutionPlan;
use colony_db::queries::tasks as task_db;
use colony_db::queries::tasks::NewTask;

use crate::error::{Error, Result};
use crate::event::{Event, EventBus, EventType};
use crate::task::TaskRepository;

/// Default freshness window for [`PlanEngine::get_execution_plan_status_cached`].
pub const DEFAULT_STATUS_CACHE_TTL: Duration = Duration::from_secs(5);

/// Input for [`PlanEngine::create_execution_plan`].
#[derive(Debug, Clone)]
pub struct PlanSpec {
    pub title: String,
    pub description: String,
    pub parent_task_id: Option<Uuid>,
    pub subtasks: Vec<SubTask>,
}

struct CachedStatus {
    status: PlanStatus,
    fetched_at: Instant,
}

/// Dependency-aware subtask scheduling over execution plans.
#[derive(Clone)]
pub struct PlanEngine {
    tasks: TaskRepository,
    bus: Arc<EventBus>,
    cache: Arc<Mutex<HashMap<Uuid, CachedStatus>>>,
    cache_ttl: Duration,
}

impl PlanEngine {
    /// Build the engine and wire its cache invalidation into the bus: any
    /// plan event or task status change clears the status cache (bus
    /// delivery is post-commit, so stale reads cannot outlive the mutation).
    pub fn new(tasks: TaskRepository, bus: Arc<EventBus>) -> Self {
        let cache: Arc<Mutex<HashMap<Uuid, CachedStatus>>> = Arc::new(Mutex::new(HashMap::new()));

        for event_type in [
            EventType::PlanStarted,
            EventType::PlanCompleted,
            EventType::PlanFailed,
            EventType::TaskStatusChanged,
        ] {
            let cache = Arc::clone(&cache);
            bus.subscribe(event_type, move |_event| {
                cache.lock().expect("plan cache lock poisoned").clear();
                Ok(())
            });
        }

        Self {
            tasks,
            bus,
            cache,
            cache_ttl: DEFAULT_STATUS_CACHE_TTL,
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    fn pool(&self) -> &SqlitePool {
        self.tasks.pool()
    }

    /// Validate and store a new execution plan. Status starts as `pending`.
    ///
    /// Errors: `validation_error` (empty title, duplicate or unknown subtask
    /// ids, cyclic dependency graph).
    pub async fn create_execution_plan(&self, spec: PlanSpec) -> Result<Uuid> {
        self.create_plan_inner(spec, None).await
    }

    async fn create_plan_inner(
        &self,
        spec: PlanSpec,
        planning_task_id: Option<Uuid>,
    ) -> Result<Uuid> {
        if spec.title.trim().is_empty() {
            return Err(Error::Validation("plan title must not be empty".into()));
        }
        let dependency_graph = validate_subtask_graph(&spec.subtasks)?;

        let id = Uuid::new_v4();
        let new = NewExecutionPlan {
            id,
            planning_task_id,
            title: spec.title,
            description: spec.description,
            parent_task_id: spec.parent_task_id,
            subtasks: spec.subtasks,
            dependency_graph,
        };
        plan_db::insert_execution_plan(self.pool(), &new, Utc::now()).await?;

        tracing::info!(plan_id = %id, subtasks = new.subtasks.len(), "created execution plan");
        Ok(id)
    }

    /// Fetch a plan snapshot.
    pub async fn get_execution_plan(&self, plan_id: Uuid) -> Result<Option<ExecutionPlan>> {
        Ok(plan_db::get_execution_plan(self.pool(), plan_id).await?)
    }

    /// Materialize a plan's subtasks into real tasks with dependency edges.
    ///
    /// All-or-nothing: every task, edge, and the subtask-id mapping commit
    /// together. Idempotent: an already-materialized plan returns 0.
    /// Returns the number of tasks created.
    pub async fn create_planned_subtasks_from_plan(&self, plan_id: Uuid) -> Result<u64> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let plan = plan_db::get_execution_plan(&mut *tx, plan_id)
            .await?
            .ok_or_else(|| Error::not_found("plan", plan_id))?;

        if plan.task_mapping.is_some() {
            return Ok(0);
        }

        // Creation follows topological order so every dependency edge can be
        // translated as it is written.
        let order = topological_order(&plan.subtasks.0)?;

        let mut mapping: HashMap<String, Uuid> = HashMap::new();
        let mut created: Vec<Task> = Vec::with_capacity(order.len());

        for index in order {
            let subtask = &plan.subtasks.0[index];
            let task_id = Uuid::new_v4();

            let new = NewTask {
                id: task_id,
                title: subtask.title.clone(),
                description: subtask.description.clone(),
                task_type: subtask.task_type.clone(),
                priority: subtask.priority,
                workflow: None,
                payload: subtask.payload.clone(),
                // Subtask events thread under the plan's correlation id.
                correlation_id: plan_id.to_string(),
                due_date: None,
                max_retries: 3,
                parent_task_id: plan.parent_task_id,
                plan_id: Some(plan_id),
                tags: Vec::new(),
                metadata: Some(serde_json::json!({ "subtask_id": subtask.id })),
            };
            let task = task_db::insert_task(&mut *tx, &new, now).await?;

            for dep in &subtask.dependencies {
                let dep_task_id = mapping.get(dep).copied().ok_or_else(|| {
                    Error::Internal(format!(
                        "dependency {dep} of subtask {} missing from mapping",
                        subtask.id
                    ))
                })?;
                task_db::insert_task_dependency(&mut *tx, task_id, dep_task_id).await?;
            }

            self.tasks.mirror_conn(&mut *tx, &task).await?;
            mapping.insert(subtask.id.clone(), task_id);
            created.push(task);
        }

        plan_db::set_task_mapping(&mut *tx, plan_id, &mapping, now).await?;
        tx.commit().await?;

        tracing::info!(plan_id = %plan_id, count = created.len(), "materialized plan subtasks");
        for task in &created {
            self.bus.publish(Event::new(
                EventType::TaskCreated,
                task.correlation_id.clone(),
                serde_json::json!({
                    "task_id": task.id,
                    "title": task.title,
                    "task_type": task.task_type,
                    "priority": task.priority,
                    "plan_id": plan_id,
                }),
            ));
        }

        Ok(created.len() as u64)
    }

    /// Current plan status, bypassing the cache.
    pub async fn get_execution_plan_status(&self, plan_id: Uuid) -> Result<Option<PlanStatus>> {
        let status = plan_db::get_plan_status(self.pool(), plan_id).await?;
        if let Some(status) = status {
            self.cache
                .lock()
                .expect("plan cache lock poisoned")
                .insert(
                    plan_id,
                    CachedStatus {
                        status,
                        fetched_at: Instant::now(),
                    },
                );
        }
        Ok(status)
    }

    /// Current plan status, served from a short-lived cache when fresh.
    ///
    /// The cache is invalidated on every plan mutation (via the bus), so a
    /// hit can never outlive a committed change.
    pub async fn get_execution_plan_status_cached(
        &self,
        plan_id: Uuid,
    ) -> Result<Option<PlanStatus>> {
        {
            let cache = self.cache.lock().expect("plan cache lock poisoned");
            if let Some(entry) = cache.get(&plan_id) {
                if entry.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(Some(entry.status));
                }
            }
        }
        self.get_execution_plan_status(plan_id).await
    }

    /// True iff every dependency of the task is `completed`.
    pub async fn check_subtask_dependencies(&self, task_id: Uuid) -> Result<bool> {
        task_db::get_task(self.pool(), task_id)
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))?;
        let unmet = task_db::unmet_dependency_count(self.pool(), task_id).await?;
        Ok(unmet == 0)
    }

    /// Batch dependency check: one grouped query over the union of all
    /// dependency edges, not a per-task loop.
    pub async fn check_subtask_dependencies_batch(
        &self,
        task_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, bool>> {
        let mut conn = self.pool().acquire().await.map_err(Error::from)?;
        let counts = task_db::unmet_dependency_counts(&mut conn, task_ids).await?;

        let mut result: HashMap<Uuid, bool> =
            task_ids.iter().map(|id| (*id, true)).collect();
        for (task_id, unmet) in counts {
            result.insert(task_id, unmet == 0);
        }
        Ok(result)
    }

    /// Highest-priority ready queued subtask of a plan, or `None`.
    pub async fn get_next_planned_subtask(&self, plan_id: Uuid) -> Result<Option<Task>> {
        Ok(task_db::next_ready_for_plan(self.pool(), plan_id).await?)
    }

    /// Transition a plan `pending -> in_progress` and open its progress row.
    ///
    /// Idempotent: an already-running plan is a no-op. Emits `plan.started`
    /// on the actual transition. Errors: `not_found`, `state_error` (plan
    /// already terminal).
    pub async fn mark_plan_execution_started(&self, plan_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool().begin().await?;

        let plan = plan_db::get_execution_plan(&mut *tx, plan_id)
            .await?
            .ok_or_else(|| Error::not_found("plan", plan_id))?;

        match plan.status {
            PlanStatus::InProgress => return Ok(()),
            PlanStatus::Pending => {}
            terminal => {
                return Err(Error::State(format!(
                    "plan {plan_id} is {terminal} and cannot start"
                )));
            }
        }

        plan_db::transition_plan_status(
            &mut *tx,
            plan_id,
            PlanStatus::Pending,
            PlanStatus::InProgress,
            now,
        )
        .await?;
        plan_db::insert_plan_execution(&mut *tx, Uuid::new_v4(), plan_id, now).await?;
        tx.commit().await?;

        self.cache
            .lock()
            .expect("plan cache lock poisoned")
            .remove(&plan_id);

        tracing::info!(plan_id = %plan_id, "plan execution started");
        self.bus.publish(Event::new(
            EventType::PlanStarted,
            plan_id.to_string(),
            serde_json::json!({ "plan_id": plan_id }),
        ));
        Ok(())
    }

    // -------------------------------------------------------------------
    // Planning queue
    // -------------------------------------------------------------------

    /// Enqueue a planning request for a planner agent.
    ///
    /// Emits `plan.requested`.
    pub async fn submit_planning_request(
        &self,
        task_description: &str,
        priority: i64,
        requestor: Option<&str>,
        context_data: Option<Value>,
    ) -> Result<Uuid> {
        if task_description.trim().is_empty() {
            return Err(Error::Validation(
                "planning request description must not be empty".into(),
            ));
        }

        let id = Uuid::new_v4();
        plan_db::insert_planning_request(
            self.pool(),
            id,
            task_description,
            priority,
            requestor,
            context_data.as_ref(),
            Utc::now(),
        )
        .await?;

        self.bus.publish(Event::new(
            EventType::PlanRequested,
            id.to_string(),
            serde_json::json!({
                "planning_task_id": id,
                "requestor": requestor,
            }),
        ));
        Ok(id)
    }

    /// Hand a pending planning request to a planner agent.
    pub async fn assign_planning_request(&self, request_id: Uuid, agent: &str) -> Result<()> {
        let rows =
            plan_db::assign_planning_request(self.pool(), request_id, agent, Utc::now()).await?;
        if rows == 0 {
            return match plan_db::get_planning_request(self.pool(), request_id).await? {
                None => Err(Error::not_found("planning request", request_id)),
                Some(request) => Err(Error::Conflict(format!(
                    "planning request {request_id} is {} (expected pending)",
                    request.status
                ))),
            };
        }
        Ok(())
    }

    /// Record the plan generated for a planning request, completing it.
    ///
    /// The plan insert and the queue completion commit together. Emits
    /// `plan.generated`.
    pub async fn complete_planning_request(
        &self,
        request_id: Uuid,
        spec: PlanSpec,
    ) -> Result<Uuid> {
        if spec.title.trim().is_empty() {
            return Err(Error::Validation("plan title must not be empty".into()));
        }
        let dependency_graph = validate_subtask_graph(&spec.subtasks)?;

        let now = Utc::now();
        let plan_id = Uuid::new_v4();
        let mut tx = self.pool().begin().await?;

        let rows = plan_db::complete_planning_request(&mut *tx, request_id, now).await?;
        if rows == 0 {
            return match plan_db::get_planning_request(self.pool(), request_id).await? {
                None => Err(Error::not_found("planning request", request_id)),
                Some(request) => Err(Error::Conflict(format!(
                    "planning request {request_id} is already {}",
                    request.status
                ))),
            };
        }

        let new = NewExecutionPlan {
            id: plan_id,
            planning_task_id: Some(request_id),
            title: spec.title,
            description: spec.description,
            parent_task_id: spec.parent_task_id,
            subtasks: spec.subtasks,
            dependency_graph,
        };
        plan_db::insert_execution_plan(&mut *tx, &new, now).await?;
        tx.commit().await?;

        self.bus.publish(Event::new(
            EventType::PlanGenerated,
            request_id.to_string(),
            serde_json::json!({
                "planning_task_id": request_id,
                "plan_id": plan_id,
                "subtask_count": new.subtasks.len(),
            }),
        ));
        Ok(plan_id)
    }
}

/// Validate subtask ids and dependencies, returning the dependency graph.
///
/// Rejects duplicate ids, references to unknown subtasks, and cycles.
fn validate_subtask_graph(subtasks: &[SubTask]) -> Result<HashMap<String, Vec<String>>> {
    let mut graph: HashMap<String, Vec<String>> = HashMap::new();
    for subtask in subtasks {
        if subtask.id.trim().is_empty() {
            return Err(Error::Validation("subtask id must not be empty".into()));
        }
        if graph
            .insert(subtask.id.clone(), subtask.dependencies.clone())
            .is_some()
        {
            return Err(Error::Validation(format!(
                "duplicate subtask id {:?}",
                subtask.id
            )));
        }
    }
    for subtask in subtasks {
        for dep in &subtask.dependencies {
            if !graph.contains_key(dep) {
                return Err(Error::Validation(format!(
                    "subtask {:?} depends on unknown subtask {:?}",
                    subtask.id, dep
                )));
            }
        }
    }

    // Cycle check via toposort; the order itself is recomputed at
    // materialization time.
    topological_order(subtasks)?;
    Ok(graph)
}

/// Topological order of subtask indices (dependencies first).
fn topological_order(subtasks: &[SubTask]) -> Result<Vec<usize>> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

    for (index, subtask) in subtasks.iter().enumerate() {
        nodes.insert(subtask.id.as_str(), graph.add_node(index));
    }
    for subtask in subtasks {
        let to = nodes[subtask.id.as_str()];
        for dep in &subtask.dependencies {
            let from = *nodes.get(dep.as_str()).ok_or_else(|| {
                Error::Validation(format!(
                    "subtask {:?} depends on unknown subtask {:?}",
                    subtask.id, dep
                ))
            })?;
            graph.add_edge(from, to, ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let index = graph[cycle.node_id()];
        Error::Validation(format!(
            "dependency graph contains a cycle through subtask {:?}",
            subtasks[index].id
        ))
    })?;

    Ok(sorted.into_iter().map(|node| graph[node]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn graph_validation_accepts_dag() {
        let subtasks = vec![
            subtask("a", &[]),
            subtask("b", &["a"]),
            subtask("c", &["a", "b"]),
        ];
        let graph = validate_subtask_graph(&subtasks).unwrap();
        assert_eq!(graph["c"], vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn graph_validation_rejects_cycle() {
        let subtasks = vec![subtask("a", &["b"]), subtask("b", &["a"])];
        let err = validate_subtask_graph(&subtasks).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[test]
    fn graph_validation_rejects_unknown_dependency() {
        let subtasks = vec![subtask("a", &["ghost"])];
        assert!(validate_subtask_graph(&subtasks).is_err());
    }

    #[test]
    fn graph_validation_rejects_duplicate_ids() {
        let subtasks = vec![subtask("a", &[]), subtask("a", &[])];
        assert!(validate_subtask_graph(&subtasks).is_err());
    }

    #[test]
    fn topological_order_puts_dependencies_first() {
        let subtasks = vec![
            subtask("c", &["a", "b"]),
            subtask("a", &[]),
            subtask("b", &["a"]),
        ];
        let order = topological_order(&subtasks).unwrap();
        let position = |id: &str| {
            order
                .iter()
                .position(|&i| subtasks[i].id == id)
                .expect("id present")
        };
        assert!(position("a") < position("b"));
        assert!(position("b") < position("c"));
    }
}
