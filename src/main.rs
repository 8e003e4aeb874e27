//! RustServe - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use rustserve::{Server, ServerConfig, TracingSink};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// RustServe - multi-domain HTTPS front server
#[derive(Parser, Debug)]
#[command(name = "rustserve")]
#[command(author = "RustServe Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Serve static files or proxy to backends for many domains over HTTPS")]
struct Args {
    /// Configuration file
    #[arg(env = "CONFIG", default_value = "/etc/rustserve.json")]
    config: PathBuf,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Annotate log lines with source file and line
    #[arg(long, env = "DEVMODE")]
    devmode: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    init_logging(&args, config.log_file.as_deref())?;

    info!("Starting RustServe v1.0.0");
    info!("Loaded configuration from {}", args.config.display());
    info!("Serving {} domain(s)", config.domains.len());

    let server = Arc::new(Server::new(Arc::new(config), Arc::new(TracingSink)));

    tokio::select! {
        result = server.run() => result?,
        _ = shutdown_signal() => info!("Received interrupt"),
    }

    Ok(())
}

fn init_logging(args: &Args, log_file: Option<&Path>) -> Result<()> {
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_file(args.devmode)
        .with_line_number(args.devmode)
        .compact();

    match log_file {
        Some(path) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(open_log_file(path)?))
            .try_init(),
        None => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("initializing logging: {}", e))?;

    if let Some(path) = log_file {
        info!("Log file opened: {}", path.display());
    }
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o640);
    }
    options
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
