mod chimera_cmd;
mod config;
mod plan_cmds;
mod serve_cmd;
mod task_cmds;
mod worker_cmds;

use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};

use colony_core::Client;
use colony_core::agent::AgentRegistry;
use colony_core::event::EventBus;
use colony_db::pool;

use config::ColonyConfig;

#[derive(Parser)]
#[command(name = "colony", about = "Task orchestration core for multi-agent platforms")]
struct Cli {
    /// Database URL (overrides COLONY_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a colony config file (no database required)
    Init {
        /// Database URL to record in the config file
        #[arg(long)]
        db_url: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database and run migrations
    DbInit,
    /// Task management
    Task {
        #[command(subcommand)]
        command: task_cmds::TaskCommands,
    },
    /// Worker management
    Worker {
        #[command(subcommand)]
        command: worker_cmds::WorkerCommands,
    },
    /// Execution plan management
    Plan {
        #[command(subcommand)]
        command: plan_cmds::PlanCommands,
    },
    /// Create a Chimera workflow task
    Chimera {
        /// Natural-language feature description
        feature: String,
        /// Production URL for testing
        target_url: String,
        /// Staging URL for validation
        #[arg(long)]
        staging_url: Option<String>,
        /// Task priority (higher = more urgent)
        #[arg(long, default_value_t = 3)]
        priority: i64,
    },
    /// Serve the HTTP API and event stream
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 7411)]
        port: u16,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate for
        shell: clap_complete::Shell,
    },
}

/// Open the pool and build a client against it.
async fn connect(cli_db_url: Option<&str>) -> anyhow::Result<(ColonyConfig, Client)> {
    let resolved = ColonyConfig::resolve(cli_db_url)?;
    pool::ensure_database_dir(&resolved.db_config)?;
    let pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&pool, pool::default_migrations_path()).await?;

    let bus = Arc::new(EventBus::new());
    let agents = Arc::new(AgentRegistry::new());
    let client = Client::with_options(
        pool,
        bus,
        agents,
        colony_core::ClientOptions {
            dual_write: false,
            heartbeat_timeout: resolved.heartbeat_timeout,
        },
    );
    Ok((resolved, client))
}

fn cmd_init(db_url: Option<&str>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let url = db_url
        .map(str::to_owned)
        .unwrap_or_else(colony_db::config::DbConfig::default_url);
    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: url.clone() },
        orchestrator: config::OrchestratorSection::default(),
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {url}");
    println!();
    println!("Next: run `colony db-init` to create and migrate the database.");
    Ok(())
}

async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = ColonyConfig::resolve(cli_db_url)?;

    println!("Initializing colony database...");
    pool::ensure_database_dir(&resolved.db_config)?;
    let pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&pool, pool::default_migrations_path()).await?;

    println!("Database ready at {}", resolved.db_config.database_url);
    for (table, count) in pool::table_counts(&pool).await? {
        println!("  {table}: {count} rows");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_url = cli.database_url.as_deref();

    match cli.command {
        Commands::Init { db_url: url, force } => cmd_init(url.as_deref(), force),
        Commands::DbInit => cmd_db_init(db_url).await,
        Commands::Task { command } => {
            let (_, client) = connect(db_url).await?;
            task_cmds::run(&client, command).await
        }
        Commands::Worker { command } => {
            let (_, client) = connect(db_url).await?;
            worker_cmds::run(&client, command).await
        }
        Commands::Plan { command } => {
            let (_, client) = connect(db_url).await?;
            plan_cmds::run(&client, command).await
        }
        Commands::Chimera {
            feature,
            target_url,
            staging_url,
            priority,
        } => {
            let (_, client) = connect(db_url).await?;
            chimera_cmd::run(&client, &feature, &target_url, staging_url.as_deref(), priority)
                .await
        }
        Commands::Serve { bind, port } => {
            let (resolved, client) = connect(db_url).await?;
            serve_cmd::run_serve(client, resolved, &bind, port).await
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "colony",
                &mut std::io::stdout(),
            );
            Ok(())
        }
    }
}
