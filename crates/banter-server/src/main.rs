use std::future::IntoFuture;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use banter_crypto::RsaIdentity;
use banter_db::Database;
use banter_server::{Config, Engine};

/// Secure real-time group-chat backend over an encrypted datagram protocol.
#[derive(Parser)]
#[command(name = "banter-server")]
#[command(author, version, about)]
struct Cli {
    /// Log level (overridden by RUST_LOG when set)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or migrate the database schema; safe to re-run
    #[command(name = "init_db")]
    InitDb,

    /// Run the server until SIGINT/SIGTERM
    Start,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .init();

    let config = Config::from_env()?;

    match cli.command {
        Commands::InitDb => init_db(&config),
        Commands::Start => start(config),
    }
}

fn init_db(config: &Config) -> Result<()> {
    ensure_parent_dir(&config.db_path)?;
    Database::open(&config.db_path)?;
    info!("database ready at {}", config.db_path.display());
    Ok(())
}

fn start(config: Config) -> Result<()> {
    ensure_parent_dir(&config.db_path)?;
    let db = Arc::new(Database::open(&config.db_path)?);
    let identity = Arc::new(RsaIdentity::load_or_create(&config.key_dir)?);
    let ai_backend = config.ai_backend()?;

    let engine = Engine::start(&config, db, identity, ai_backend)?;
    info!("listening on udp://{}", engine.local_addr());

    // The engine is plain threads; tokio only carries the metrics endpoint
    // and signal handling.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(config.metrics_addr)
            .await
            .with_context(|| format!("cannot bind metrics on {}", config.metrics_addr))?;
        info!("metrics on http://{}/metrics", config.metrics_addr);

        let app = banter_server::http::metrics_app(engine.gateway.clone());
        tokio::select! {
            result = axum::serve(listener, app).into_future() => {
                result.context("metrics server failed")
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                Ok(())
            }
        }
    })?;

    engine.shutdown();
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn ensure_parent_dir(path: &std::path::Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
    }
    Ok(())
}
