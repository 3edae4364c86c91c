//! sqal-fusion - Sensor Fusion Quality Control Service
//!
//! **Module Identity:**
//! - Name: sqal-fusion
//! - Port: 5790 (default)
//!
//! Accepts depth-array and spectral frames over HTTP/WebSocket, grades each
//! sample and streams results to dashboards over WebSocket and SSE.

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sqal_common::config::{write_toml_config, LoggingConfig};
use sqal_fusion::api::health::BuildInfo;
use sqal_fusion::config::{self, ConfigOverrides};
use sqal_fusion::AppState;

/// Command-line arguments for sqal-fusion
#[derive(Parser, Debug)]
#[command(name = "sqal-fusion")]
#[command(about = "Sensor fusion quality control service")]
#[command(version)]
struct Args {
    /// Configuration file (otherwise SQAL_CONFIG, then the user and system config dirs)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, env = "SQAL_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "SQAL_PORT")]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "SQAL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Write the effective configuration to this path and exit
    #[arg(long, value_name = "PATH")]
    dump_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let resolved = config::resolve(&ConfigOverrides {
        config_path: args.config.clone(),
        host: args.host.clone(),
        port: args.port,
        log_level: args.log_level.clone(),
    })
    .context("Failed to load configuration")?;

    if let Some(path) = &args.dump_config {
        write_toml_config(&resolved.config, path)
            .with_context(|| format!("Failed to write configuration to {}", path.display()))?;
        println!("Configuration written to {}", path.display());
        return Ok(());
    }

    init_tracing(&resolved.config.logging)?;

    let build = BuildInfo::current();
    info!("Starting sqal-fusion (Sensor Fusion Quality Control)");
    info!(
        "Version: {} (git {}, built {}, {})",
        build.version, build.git_hash, build.build_timestamp, build.build_profile
    );
    match &resolved.source {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: built-in defaults"),
    }

    let config = resolved.config;
    info!(
        "Fusion: expecting {:?}, wait {} ms, disagreement threshold {}",
        config.fusion.expected_modalities,
        config.fusion.timeout_ms,
        config.fusion.disagreement_threshold
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;

    let state = AppState::new(config);
    let app = sqal_fusion::build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Streaming connections never finish on their own
            shutdown_state.shutdown();
        })
        .await
        .context("Server error")?;

    let pending = state.pipeline.engine().pending().len();
    if pending > 0 {
        warn!("{} samples were still waiting at shutdown", pending);
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Console logging plus an optional plain-text log file
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "sqal_fusion={level},sqal_common={level},tower_http={level}",
            level = logging.level
        ))
    });

    let file_layer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
