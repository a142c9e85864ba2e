//! `weft` command-line entry point.

mod config;

use clap::{Parser, Subcommand};
use config::WeftConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use weft_gateway::{AppState, AuthConfig, GatewayServer};
use weft_orchestrator::{
    plan_levels, EventBus, HttpAgentTransport, InMemoryRegistry, InMemoryResultCache, LockManager,
    Orchestrator, TaskBoard, WorkflowDefinition,
};

#[derive(Parser)]
#[command(name = "weft", about = "Weft: workflow and task orchestration for remote agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway with the configured agents
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Skip the startup health probe; agents start online
        #[arg(long)]
        no_probe: bool,
    },
    /// Validate a workflow definition and print its execution levels
    Plan {
        /// JSON file with `name` and `stages`
        workflow: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            no_probe,
        } => {
            let config = WeftConfig::load(&cli.config).await?;
            serve(config, host, port, no_probe).await?;
        }
        Commands::Plan { workflow } => plan(&workflow).await?,
    }

    Ok(())
}

async fn serve(
    config: WeftConfig,
    host: Option<String>,
    port: Option<u16>,
    no_probe: bool,
) -> anyhow::Result<()> {
    let host = host.unwrap_or(config.server.host);
    let port = port.unwrap_or(config.server.port);

    let auth = AuthConfig::new(config.server.api_keys);
    if auth.is_enabled() {
        info!(keys = auth.api_keys.len(), "API key auth enabled");
    }

    let transport = Arc::new(HttpAgentTransport::new());
    let registry = Arc::new(InMemoryRegistry::with_agents(config.agents));
    let agent_count = registry.list().await.len();
    if no_probe {
        info!(agents = agent_count, "Agents registered without health probe");
    } else {
        let online = registry
            .probe_all(transport.as_ref(), config.orchestrator.health_timeout())
            .await;
        info!(agents = agent_count, online, "Agents probed");
    }

    let events = Arc::new(EventBus::new());
    let orchestrator = Orchestrator::builder(registry.clone(), transport)
        .config(config.orchestrator)
        .journal_dir(config.data_dir.join("audit"))
        .events(events.clone())
        .cache(Arc::new(InMemoryResultCache::new()))
        .build();

    let board = Arc::new(TaskBoard::new().with_events(events.clone()));
    board.spawn_promoter();

    let locks = Arc::new(LockManager::new());
    let sweeper = locks.clone();
    let sweep_every = Duration::from_secs(config.lock_sweep_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let swept = sweeper.sweep_expired();
            if swept > 0 {
                info!(swept, "Expired locks released");
            }
        }
    });

    let state = Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
        board,
        locks,
        registry,
        events,
    });
    let app = GatewayServer::build(state, auth);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Weft gateway listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn plan(path: &Path) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read workflow '{}': {e}", path.display()))?;
    let definition: WorkflowDefinition = serde_json::from_str(&raw)?;
    let plan = plan_levels(&definition.stages)?;

    println!(
        "Workflow '{}': {} stage(s) in {} level(s)",
        definition.name,
        plan.stage_count(),
        plan.level_count()
    );
    for (level, stages) in plan.levels().iter().enumerate() {
        println!("  level {level}: {}", stages.join(", "));
    }
    Ok(())
}
