//! VpnGate Daemon (vpngated)
//!
//! Keeps the certificate revocation list fresh: it is published once on
//! start and then every hour, so CRL validity never lapses while the VPN
//! daemon is running.
//!
//! # Usage
//!
//! ```bash
//! sudo vpngated
//! sudo vpngated --verbose --config /etc/vpngate/vpngate.toml
//! ```

use clap::Parser;
use libvpngate::config::{GateConfig, DEFAULT_CONFIG_FILE};
use libvpngate::error::{GateError, GateResult};
use libvpngate::revocation::{CrlPublisher, RevocationLog, PUBLISH_INTERVAL};
use libvpngate::settings::{FileSettings, SettingsStore};
use libvpngate::{PkiEngine, StateStore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// VpnGate Daemon
#[derive(Parser, Debug)]
#[command(name = "vpngated")]
#[command(version)]
#[command(about = "VpnGate Daemon - publishes the certificate revocation list", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Shared state for signal handling
struct DaemonState {
    running: Arc<RwLock<bool>>,
}

impl DaemonState {
    fn new() -> Self {
        Self {
            running: Arc::new(RwLock::new(true)),
        }
    }

    async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        info!("Daemon stop requested");
    }
}

#[tokio::main]
async fn main() -> GateResult<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting VpnGate Daemon (vpngated)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let uid = unsafe { libc::getuid() };
    if uid != 0 {
        warn!("Not running as root, writing the CRL may fail");
    }

    let config = GateConfig::load_or_default(&args.config)?;
    let settings: Arc<dyn SettingsStore> = Arc::new(FileSettings::open(&config.paths.settings_file)?);
    let store = Arc::new(StateStore::open(&config.paths.state_file)?);
    let publisher = CrlPublisher::new(
        PkiEngine::new(settings.clone()),
        RevocationLog::new(store),
        &config.paths.crl_file,
    );

    let state = Arc::new(DaemonState::new());
    let state_clone = state.clone();
    let signal_settings = settings.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_signals(state_clone, signal_settings).await {
            error!("Signal handler error: {}", e);
        }
    });

    info!("Publishing CRL to {:?} every {} minutes", publisher.path(), PUBLISH_INTERVAL.as_secs() / 60);
    let published = publisher.run(settings.as_ref(), PUBLISH_INTERVAL, &state.running).await;

    info!("VpnGate Daemon stopped after {} publications", published);
    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose { "debug" } else { &args.log_level };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("vpngated={},libvpngate={}", log_level, log_level))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Handle Unix signals (SIGTERM, SIGINT, SIGHUP)
async fn handle_signals(state: Arc<DaemonState>, settings: Arc<dyn SettingsStore>) -> GateResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| GateError::ConfigError(format!("Failed to register SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| GateError::ConfigError(format!("Failed to register SIGINT handler: {}", e)))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| GateError::ConfigError(format!("Failed to register SIGHUP handler: {}", e)))?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                state.stop().await;
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                state.stop().await;
                return Ok(());
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading settings");
                match settings.reload() {
                    Ok(()) => info!("Settings reloaded"),
                    Err(e) => warn!("Failed to reload settings: {}", e),
                }
            }
        }
    }
}
