//! `colony worker` subcommands.

use anyhow::Result;
use clap::Subcommand;

use colony_core::Client;
use colony_db::models::WorkerStatus;

#[derive(Subcommand)]
pub enum WorkerCommands {
    /// Register (or re-register) a worker
    Register {
        /// Worker ID
        worker_id: String,
        /// Worker role (executor, backend, ...)
        #[arg(long)]
        role: String,
        /// Comma-separated capabilities
        #[arg(long)]
        capabilities: Option<String>,
    },
    /// Send a heartbeat for a worker
    Heartbeat {
        /// Worker ID
        worker_id: String,
        /// New status
        #[arg(long)]
        status: Option<WorkerStatus>,
    },
    /// List active workers
    List {
        /// Role filter
        #[arg(long)]
        role: Option<String>,
    },
    /// Claim the next ready task for a worker
    Claim {
        /// Worker ID
        worker_id: String,
        /// Capability filter (matches task_type or a tag)
        #[arg(long)]
        capability: Option<String>,
    },
    /// Unregister a worker (requeues any held task)
    Unregister {
        /// Worker ID
        worker_id: String,
    },
}

pub async fn run(client: &Client, command: WorkerCommands) -> Result<()> {
    match command {
        WorkerCommands::Register {
            worker_id,
            role,
            capabilities,
        } => {
            let capabilities = capabilities
                .map(|c| c.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            client
                .register_worker(&worker_id, &role, capabilities, None)
                .await?;
            println!("registered {worker_id}");
            Ok(())
        }
        WorkerCommands::Heartbeat { worker_id, status } => {
            let known = client.update_worker_heartbeat(&worker_id, status).await?;
            if known {
                println!("ok");
            } else {
                anyhow::bail!("worker {worker_id} is not registered");
            }
            Ok(())
        }
        WorkerCommands::List { role } => {
            for worker in client.get_active_workers(role.as_deref()).await? {
                println!(
                    "{}  [{}] role={} capabilities={} last_heartbeat={}",
                    worker.id,
                    worker.status,
                    worker.role,
                    worker.capabilities.0.join(","),
                    worker.last_heartbeat
                );
            }
            Ok(())
        }
        WorkerCommands::Claim {
            worker_id,
            capability,
        } => {
            match client.claim_task(&worker_id, capability.as_deref()).await? {
                Some((task, run)) => {
                    println!("claimed {} (run #{} {})", task.id, run.run_number, run.id);
                    println!("  {} - {}", task.task_type, task.title);
                }
                None => println!("nothing to claim"),
            }
            Ok(())
        }
        WorkerCommands::Unregister { worker_id } => {
            if client.unregister_worker(&worker_id).await? {
                println!("unregistered {worker_id}");
            } else {
                println!("worker {worker_id} was not registered");
            }
            Ok(())
        }
    }
}
