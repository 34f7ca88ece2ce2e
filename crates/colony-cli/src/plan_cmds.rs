//! `colony plan` subcommands.
//!
//! Plans are created from a JSON file:
//!
//! ```json
//! {
//!   "title": "Ship the feature",
//!   "description": "",
//!   "subtasks": [
//!     {"id": "a", "title": "Schema", "task_type": "code"},
//!     {"id": "b", "title": "API", "task_type": "code", "dependencies": ["a"]}
//!   ]
//! }
//! ```

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Deserialize;
use uuid::Uuid;

use colony_core::Client;
use colony_core::plan::PlanSpec;
use colony_db::models::SubTask;

#[derive(Debug, Deserialize)]
struct PlanFile {
    title: String,
    #[serde(default)]
    description: String,
    subtasks: Vec<SubTask>,
}

#[derive(Subcommand)]
pub enum PlanCommands {
    /// Create a plan from a JSON file
    Create {
        /// Path to the plan JSON file
        file: String,
    },
    /// Materialize a plan's subtasks into tasks
    Materialize {
        /// Plan ID
        plan_id: Uuid,
    },
    /// Show plan status and counters
    Status {
        /// Plan ID
        plan_id: Uuid,
    },
    /// Show the next ready subtask of a plan
    Next {
        /// Plan ID
        plan_id: Uuid,
    },
    /// Mark plan execution started
    Start {
        /// Plan ID
        plan_id: Uuid,
    },
}

pub async fn run(client: &Client, command: PlanCommands) -> Result<()> {
    match command {
        PlanCommands::Create { file } => {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read plan file {file}"))?;
            let plan: PlanFile =
                serde_json::from_str(&contents).context("plan file is not valid JSON")?;

            let id = client
                .create_execution_plan(PlanSpec {
                    title: plan.title,
                    description: plan.description,
                    parent_task_id: None,
                    subtasks: plan.subtasks,
                })
                .await?;
            println!("{id}");
            Ok(())
        }
        PlanCommands::Materialize { plan_id } => {
            let count = client.create_planned_subtasks_from_plan(plan_id).await?;
            println!("created {count} subtasks");
            Ok(())
        }
        PlanCommands::Status { plan_id } => {
            let plan = client
                .get_execution_plan(plan_id)
                .await?
                .with_context(|| format!("plan {plan_id} not found"))?;
            println!(
                "{}  [{}] {}/{} completed, {} failed - {}",
                plan.id,
                plan.status,
                plan.completed_subtasks,
                plan.total_subtasks,
                plan.failed_subtasks,
                plan.title
            );
            Ok(())
        }
        PlanCommands::Next { plan_id } => {
            match client.get_next_planned_subtask(plan_id).await? {
                Some(task) => println!("{}  p{} {}", task.id, task.priority, task.title),
                None => println!("no subtask ready"),
            }
            Ok(())
        }
        PlanCommands::Start { plan_id } => {
            client.mark_plan_execution_started(plan_id).await?;
            println!("started {plan_id}");
            Ok(())
        }
    }
}
