//! webhook-pipeline - stores inbound webhooks and re-delivers them downstream
//! in cron-driven batches.

use anyhow::Context;
use axum::http::Request;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use webhook_pipeline::{
    router, AppState, Config, EventStore, HttpForwarder, KillSwitch, MemoryEventStore, Processor,
    Reaper, ReplayController, SqliteEventStore,
};

#[derive(Parser, Debug)]
#[command(name = "webhook-pipeline")]
#[command(about = "Webhook event ingestion, processing and replay", long_about = None)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,

    /// Keep events in memory instead of SQLite.
    #[arg(long)]
    memory: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Run a single processor pass and exit.
    Process {
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Requeue a failed event.
    Retry { id: Uuid },
    /// Fail events stuck in `processing`.
    Reap {
        #[arg(long)]
        older_than_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn EventStore> = if args.memory {
        tracing::warn!("using in-memory event store; events are lost on exit");
        Arc::new(MemoryEventStore::new())
    } else {
        Arc::new(
            SqliteEventStore::open(&config.db_path)
                .with_context(|| format!("failed to open {}", config.db_path.display()))?,
        )
    };

    let handler = Arc::new(HttpForwarder::new(
        config.forward_url.clone(),
        config.forward_secret.clone(),
    ));
    let processor = Processor::new(
        store.clone(),
        handler,
        KillSwitch::new(config.processing_enabled),
        config.attempt_timeout,
        config.max_batch_size,
    );

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, store, processor).await,
        Command::Process { batch_size } => {
            let batch_size = batch_size.unwrap_or(config.default_batch_size);
            let summary = processor.process_pending_events(batch_size).await?;
            println!("{}", serde_json::to_string(&summary)?);
            Ok(())
        }
        Command::Retry { id } => {
            let event = ReplayController::new(store).retry_event(id).await?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(())
        }
        Command::Reap { older_than_secs } => {
            let older_than = older_than_secs
                .map(Duration::from_secs)
                .or(config.stale_after)
                .context("--older-than-secs is required when WEBHOOK_STALE_AFTER_SECS is unset")?;
            let ids = Reaper::new(store, config.attempt_timeout)
                .reap(older_than)
                .await?;
            println!("{}", serde_json::to_string(&ids)?);
            Ok(())
        }
    }
}

async fn serve(
    config: Config,
    store: Arc<dyn EventStore>,
    processor: Processor,
) -> anyhow::Result<()> {
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, store, processor);

    let app = router(state).layer(TraceLayer::new_for_http().make_span_with(
        |request: &Request<_>| {
            tracing::span!(
                Level::INFO,
                "http_request",
                method = %request.method(),
                path = %request.uri().path()
            )
        },
    ));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "starting server");

    axum::serve(listener, app).await?;
    Ok(())
}
