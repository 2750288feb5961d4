use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use conductor::adapter::compatible::CompatibleAdapter;
use conductor::adapter::scripted::ScriptedAdapter;
use conductor::adapter::AgentAdapter;
use conductor::api::{self, AppState};
use conductor::config::Config;
use conductor::event::sink::EventSink;
use conductor::run::RunManager;
use conductor::store::events::EventRepository;
use conductor::store::hierarchies::HierarchyRepository;
use conductor::store::runs::RunRepository;
use conductor::store::Db;
use conductor::stream::StreamRegistry;

/// Hierarchical multi-agent run orchestrator.
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about = "Execute tasks against agent hierarchies and stream the events.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP service.
    Serve {
        /// Path to a TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the bind address (e.g. 127.0.0.1:8700).
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, bind } => serve(config.as_deref(), bind).await,
    }
}

async fn serve(config_path: Option<&std::path::Path>, bind: Option<String>) -> Result<()> {
    let mut config = Config::load(config_path)?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }

    let db = Db::open(&config.db_path)?;
    let runs = RunRepository::new(db.clone());
    let hierarchies = HierarchyRepository::new(db.clone());
    let events = EventRepository::new(db);
    let registry = Arc::new(StreamRegistry::new(config.subscriber_buffer));
    let sink = Arc::new(EventSink::new(events.clone(), registry.clone()));

    let adapter: Arc<dyn AgentAdapter> = match config.adapter.kind.as_str() {
        "compatible" => {
            info!(base_url = %config.adapter.base_url, model = %config.adapter.model,
                  "using OpenAI-compatible adapter");
            Arc::new(CompatibleAdapter::new(&config.adapter))
        }
        "scripted" => {
            info!("using scripted echo adapter (no API key required)");
            Arc::new(ScriptedAdapter::new())
        }
        other => anyhow::bail!("Unknown adapter kind '{other}' (expected 'scripted' or 'compatible')"),
    };

    let manager = RunManager::start(
        runs.clone(),
        hierarchies.clone(),
        sink,
        registry.clone(),
        adapter,
        config.worker_pool_size,
    );

    let state = AppState {
        runs,
        hierarchies,
        events,
        manager,
        registry,
        api_base: config.api_base.clone(),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!(
        addr = %config.bind_addr,
        api_base = %config.api_base,
        workers = config.worker_pool_size,
        "conductor listening"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
