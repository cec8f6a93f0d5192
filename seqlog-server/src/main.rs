//! Sequence Log Server Binary
//!
//! Collects trace records from client processes over the shared channel and
//! writes flushed call trees to rotating log files.
//!
//! ## Usage
//!
//! ```bash
//! # Read /etc/slog.conf if present, defaults otherwise
//! seqlog-server
//!
//! # Explicit configuration file
//! seqlog-server -f ./slog.conf
//!
//! # Refuse cross-origin viewers
//! seqlog-server --no-cors
//!
//! # More collector detail
//! RUST_LOG=seqlog_core=debug seqlog-server
//! ```
//!
//! Exit codes: 0 clean stop, 2 configuration, 3 shared channel,
//! 4 log output directory, 5 web server bind.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use seqlog_core::{RotationManager, SequenceLogService, ServiceConfig, DEFAULT_CONFIG_PATH};
use seqlog_server::{SeqLogServer, StartupError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "seqlog-server", version, about = "Sequence log service")]
struct Args {
    /// Configuration file
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,

    /// Do not send CORS headers from the web server
    #[arg(long)]
    no_cors: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seqlog_server=info,seqlog_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), StartupError> {
    let config = load_config(args.config.as_deref())?;

    let rotation = RotationManager::open(
        &config.log_output_dir,
        config.max_file_size,
        config.max_file_count,
    )
    .map_err(StartupError::OutputDir)?;
    let channel = SequenceLogService::create_channel(&config).map_err(StartupError::Channel)?;
    let web_port = config.web_server_port;

    let handle = SequenceLogService::with_parts(config, channel, rotation)
        .and_then(SequenceLogService::spawn)
        .map_err(StartupError::Service)?;

    tracing::info!("Starting Sequence Log Server v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = handle.channel_path() {
        tracing::info!("Producers attach to {}", path.display());
    }

    if web_port == 0 {
        shutdown_signal().await;
        let stats = tokio::task::spawn_blocking(move || handle.shutdown())
            .await
            .ok();
        log_final(stats);
        return Ok(());
    }

    let server = SeqLogServer::new(handle, web_port).with_cors(!args.no_cors);
    let served = server.run(shutdown_signal()).await;
    log_final(server.shutdown().await);
    served
}

fn load_config(path: Option<&Path>) -> Result<ServiceConfig, StartupError> {
    let config = match path {
        Some(path) => ServiceConfig::load(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => ServiceConfig::load(DEFAULT_CONFIG_PATH),
        None => {
            tracing::info!("{} not found, using defaults", DEFAULT_CONFIG_PATH);
            let config = ServiceConfig::default();
            config.validate().map(|_| config)
        }
    };
    config.map_err(StartupError::Config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

fn log_final(stats: Option<seqlog_core::ServiceStats>) {
    if let Some(stats) = stats {
        tracing::info!(
            "Stopped after {} records ({} flushed, {} corrupt, {} protocol violations)",
            stats.records_received,
            stats.tree.events_flushed,
            stats.corrupt_records,
            stats.protocol_violations
        );
    }
}
