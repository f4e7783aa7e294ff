use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ledgerkv_server::config::LoggingConfig;
use ledgerkv_server::persistence;
use ledgerkv_server::{
    AppState, KVStore, PersistenceLayer, ReplayEngine, ServerConfig, TransactionLog,
    create_router,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ledgerkv-server")]
#[command(about = "Key-value store over HTTP backed by a transaction log", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay the log and serve HTTP traffic (default)
    Serve,
    /// Replay the log into a scratch store and print a summary
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_found = args.config.exists();
    let config = if config_found {
        ServerConfig::from_file(&args.config)
            .with_context(|| format!("failed to load config {:?}", args.config))?
    } else {
        ServerConfig::default()
    };

    init_tracing(&config.logging);
    if !config_found {
        warn!("Config file {:?} not found, using defaults", args.config);
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Verify => verify(config).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    info!("Starting ledgerkv server v{}", env!("CARGO_PKG_VERSION"));

    let log = Arc::new(
        TransactionLog::open(&config.transaction_log)
            .await
            .context("failed to create transaction log")?,
    );
    let mut write_errors = log
        .take_errors()
        .context("transaction log error channel already taken")?;

    let store = Arc::new(KVStore::new());
    let mut engine = ReplayEngine::new();
    let recovered = engine
        .run(&log, store.as_ref())
        .await
        .context("failed to replay transaction log")?;
    info!(
        "Store rebuilt with {} keys from {} events",
        store.len(),
        recovered.events_applied
    );

    // Write failures never reach the request that caused them
    let supervisor = tokio::spawn(async move {
        while let Some(e) = write_errors.recv().await {
            error!("Transaction log write failed: {}", e);
        }
    });

    let layer = Arc::new(PersistenceLayer::new(
        store,
        Arc::clone(&log),
        config.transaction_log.durability,
    ));
    let app = create_router(AppState { layer });

    let addr = config.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, draining transaction log...");
    log.close().await;
    let _ = supervisor.await;

    Ok(())
}

async fn verify(config: ServerConfig) -> Result<()> {
    let log = TransactionLog::open(&config.transaction_log)
        .await
        .context("failed to open transaction log")?;

    let (recovered, scratch) = persistence::verify(&log)
        .await
        .context("transaction log failed verification")?;

    let summary = serde_json::json!({
        "backend": log.backend_name(),
        "recovery": recovered,
        "keys": scratch.len(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
