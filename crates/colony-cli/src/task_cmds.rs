//! `colony task` subcommands.

use anyhow::{Context, Result};
use clap::Subcommand;
use uuid::Uuid;

use colony_core::Client;
use colony_core::task::TaskSpec;
use colony_db::models::{Task, TaskStatus};

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a new task
    Create {
        /// Task title
        title: String,
        /// Task type tag (review, plan, code, deploy, ...)
        #[arg(long = "type")]
        task_type: String,
        /// Task description
        #[arg(long, default_value = "")]
        description: String,
        /// Priority (higher = more urgent)
        #[arg(long, default_value_t = 1)]
        priority: i64,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Comma-separated tags
        #[arg(long)]
        tags: Option<String>,
    },
    /// Show a task with its runs and dependencies
    Show {
        /// Task ID
        task_id: Uuid,
    },
    /// List tasks by status
    List {
        /// Status to filter by
        status: TaskStatus,
    },
    /// List ready queued tasks in dispatch order
    Queued {
        /// Maximum number to show
        #[arg(long, default_value_t = 10)]
        limit: i64,
        /// Task type filter
        #[arg(long = "type")]
        task_type: Option<String>,
    },
    /// Cancel a task
    Cancel {
        /// Task ID
        task_id: Uuid,
        /// Reason recorded on the task
        #[arg(long)]
        reason: Option<String>,
    },
    /// Delete a terminal task and its runs
    Delete {
        /// Task ID
        task_id: Uuid,
        /// Delete even if the task is not terminal
        #[arg(long)]
        force: bool,
    },
}

fn print_task_line(task: &Task) {
    println!(
        "{}  [{}] p{} {} - {}",
        task.id, task.status, task.priority, task.task_type, task.title
    );
}

pub async fn run(client: &Client, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::Create {
            title,
            task_type,
            description,
            priority,
            payload,
            tags,
        } => {
            let mut spec = TaskSpec::new(title, task_type);
            spec.description = description;
            spec.priority = priority;
            if let Some(raw) = payload {
                spec.payload =
                    Some(serde_json::from_str(&raw).context("payload is not valid JSON")?);
            }
            if let Some(tags) = tags {
                spec.tags = tags.split(',').map(|t| t.trim().to_string()).collect();
            }

            let id = client.create_task(spec).await?;
            println!("{id}");
            Ok(())
        }
        TaskCommands::Show { task_id } => {
            let task = client
                .get_task(task_id)
                .await?
                .with_context(|| format!("task {task_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&task)?);

            let deps = client.tasks().get_task_dependencies(task_id).await?;
            if !deps.is_empty() {
                println!("dependencies:");
                for dep in deps {
                    println!("  {dep}");
                }
            }

            let runs = client.get_runs_for_task(task_id).await?;
            if !runs.is_empty() {
                println!("runs:");
                for run in runs {
                    println!(
                        "  #{} {} [{}] worker={}",
                        run.run_number, run.id, run.status, run.worker_id
                    );
                }
            }
            Ok(())
        }
        TaskCommands::List { status } => {
            for task in client.get_tasks_by_status(status).await? {
                print_task_line(&task);
            }
            Ok(())
        }
        TaskCommands::Queued { limit, task_type } => {
            for task in client.get_queued_tasks(limit, task_type.as_deref()).await? {
                print_task_line(&task);
            }
            Ok(())
        }
        TaskCommands::Cancel { task_id, reason } => {
            client.cancel_task(task_id, reason.as_deref()).await?;
            println!("cancelled {task_id}");
            Ok(())
        }
        TaskCommands::Delete { task_id, force } => {
            client.delete_task(task_id, force).await?;
            println!("deleted {task_id}");
            Ok(())
        }
    }
}
