//! craftgate
//!
//! Protocol-aware TCP gateway for Minecraft-style servers.
//!
//! This service:
//! - Accepts client connections on one listen address
//! - Optionally reads a PROXY header naming the real client
//! - Routes on the hostname in the client's handshake
//! - Gates clients with global and per-destination allow-lists
//! - Optionally prefixes backend connections with a PROXY v1 header
//! - Reloads its configuration on SIGHUP

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use craftgate_gateway::{ConfigFile, ControlEvent, ControlSignals, Gateway, PidFile};

/// craftgate - hostname-routing gateway for Minecraft-style servers.
#[derive(Debug, Parser)]
#[command(name = "craftgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "CRAFTGATE_CONFIG", default_value = "config.yml")]
    config: PathBuf,

    /// Path to the pid file guarding against a second instance.
    #[arg(long, env = "CRAFTGATE_PID_FILE", default_value = "craftgate.pid")]
    pid_file: PathBuf,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "CRAFTGATE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask the running gateway to reload its configuration.
    Reload,

    /// Ask the running gateway to stop.
    Stop,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.log_json);

    match cli.command {
        Some(Command::Reload) => signal_running(&cli, Signal::SIGHUP),
        Some(Command::Stop) => signal_running(&cli, Signal::SIGTERM),
        None => serve(&cli).await,
    }
}

fn init_tracing(log_level: &str, json: bool) {
    // Prefer RUST_LOG, fall back to --log-level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn signal_running(cli: &Cli, signal: Signal) -> Result<()> {
    let pid_file = PidFile::new(&cli.pid_file);
    pid_file
        .signal(signal)
        .with_context(|| format!("Failed to signal gateway via {}", cli.pid_file.display()))?;
    Ok(())
}

async fn serve(cli: &Cli) -> Result<()> {
    let _pid_guard = PidFile::new(&cli.pid_file)
        .acquire()
        .context("Failed to acquire pid file")?;

    let config_file = ConfigFile::new(&cli.config);
    if !config_file.exists() {
        config_file
            .write_default()
            .context("Failed to write default configuration")?;
        warn!(
            path = %config_file.path().display(),
            "No configuration found, wrote defaults. Edit it and start again"
        );
        return Ok(());
    }

    let config = config_file
        .load()
        .with_context(|| format!("Failed to load {}", config_file.path().display()))?;

    info!("Starting craftgate");

    let gateway = Gateway::new(config).context("Invalid configuration")?;
    let listener = Arc::new(gateway.bind().await.context("Failed to bind listener")?);
    let mut signals = ControlSignals::install().context("Failed to install signal handlers")?;

    let mut accept_loop = tokio::spawn(Arc::clone(&listener).run());

    loop {
        tokio::select! {
            result = &mut accept_loop => {
                result
                    .context("Listener task failed")?
                    .context("Listener error")?;
                break;
            }
            event = signals.recv() => match event {
                Some(ControlEvent::Reload) => reload(&gateway, &config_file),
                Some(ControlEvent::Stop) | None => gateway.stop(),
            },
        }
    }

    let stats = listener.stats();
    info!(
        accepted = stats.connections_accepted.load(Ordering::Relaxed),
        active = stats.connections_active.load(Ordering::Relaxed),
        denied = stats.connections_denied.load(Ordering::Relaxed),
        rejected = stats.connections_rejected.load(Ordering::Relaxed),
        "craftgate stopped"
    );

    Ok(())
}

fn reload(gateway: &Gateway, config_file: &ConfigFile) {
    info!(path = %config_file.path().display(), "Reloading configuration");

    match config_file
        .load()
        .and_then(|config| gateway.update_config(config))
    {
        Ok(()) => info!("Configuration reloaded"),
        Err(e) => error!(error = %e, "Reload failed, keeping current configuration"),
    }
}
