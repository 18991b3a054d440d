//! vpngate - hook handler and operator CLI
//!
//! The VPN daemon runs `vpngate hook <name>` for each lifecycle event; the
//! remaining subcommands are for operators.
//!
//! # Usage
//!
//! ```bash
//! # Create the certificate authority, server keys and an empty CRL
//! sudo vpngate pki init
//!
//! # Register a device and write its client configuration
//! sudo vpngate device add --user alice@example.com laptop
//! sudo vpngate device issue <device-id> --output laptop.ovpn --linux
//!
//! # Rebuild every group chain
//! sudo vpngate firewall rebuild
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libvpngate::config::{GateConfig, DEFAULT_CONFIG_FILE};
use libvpngate::revocation::{CrlPublisher, RevocationLog};
use libvpngate::settings::{keys, FileSettings, SettingsStore};
use libvpngate::vpn::common::write_secure_config;
use libvpngate::vpn::service::create_server_keys;
use libvpngate::{
    AccessService, ClientConfig, FirewallCompiler, Hook, Iptables, KeyPair, PkiEngine, StateStore, VpnLifecycle,
    VpnService,
};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "vpngate")]
#[command(version)]
#[command(about = "OpenVPN identity and access management", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a VPN daemon lifecycle hook
    Hook {
        #[arg(value_enum)]
        hook: Hook,

        /// Arguments appended by the daemon (ignored)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, hide = true)]
        extra: Vec<String>,
    },
    /// Certificate authority management
    #[command(subcommand)]
    Pki(PkiCommands),
    /// Device certificates
    #[command(subcommand)]
    Device(DeviceCommands),
    /// Active sessions
    #[command(subcommand)]
    Session(SessionCommands),
    /// Packet-filter state
    #[command(subcommand)]
    Firewall(FirewallCommands),
    /// The VPN daemon's systemd unit
    #[command(subcommand)]
    Service(ServiceCommands),
}

#[derive(Subcommand)]
enum PkiCommands {
    /// Create the CA, server keys and an empty CRL
    Init {
        /// Replace an existing certificate authority
        #[arg(long)]
        force: bool,
    },
    /// Publish the CRL from the revocation log
    Crl,
}

#[derive(Subcommand)]
enum DeviceCommands {
    /// List devices
    List,
    /// Register a device for a user
    Add {
        /// Owner's email address
        #[arg(long)]
        user: String,
        /// Device name
        name: String,
    },
    /// Issue the device keypair and print its client configuration
    Issue {
        id: Uuid,
        /// Write the configuration to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Include resolver update scripts for Linux clients
        #[arg(long)]
        linux: bool,
    },
    /// Delete a device and revoke its certificate
    Revoke { id: Uuid },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List active sessions
    List,
    /// Disconnect a session by common name
    Kill { common_name: String },
}

#[derive(Subcommand)]
enum FirewallCommands {
    /// Rebuild every enabled group chain
    Rebuild,
    /// Show the persisted top-level rules
    Show,
}

#[derive(Subcommand)]
enum ServiceCommands {
    Start,
    Stop,
    Restart,
    /// Exit 0 when the unit is active
    Status,
    /// Restart the unit if a settings change asked for it
    Apply,
}

/// Everything a subcommand may need, built from the process configuration
struct Gate {
    config: GateConfig,
    settings: Arc<dyn SettingsStore>,
    store: Arc<StateStore>,
    pki: PkiEngine,
    access: AccessService,
}

impl Gate {
    fn open(path: &Path) -> Result<Self> {
        let config = GateConfig::load_or_default(path)
            .with_context(|| format!("loading {}", path.display()))?;

        let settings: Arc<dyn SettingsStore> = Arc::new(
            FileSettings::open(&config.paths.settings_file).context("opening settings")?,
        );
        let store = Arc::new(StateStore::open(&config.paths.state_file).context("opening state")?);
        let pki = PkiEngine::new(settings.clone());

        let filter = Arc::new(Iptables::new(&config.firewall.iptables));
        let compiler = Arc::new(FirewallCompiler::new(filter, settings.clone(), &config.firewall.table));
        let access = AccessService::new(store.clone(), compiler, pki.clone())
            .with_management_socket(&config.paths.management_socket);

        Ok(Self {
            config,
            settings,
            store,
            pki,
            access,
        })
    }

    fn publisher(&self) -> CrlPublisher {
        CrlPublisher::new(
            self.pki.clone(),
            RevocationLog::new(self.store.clone()),
            &self.config.paths.crl_file,
        )
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let ctx = Gate::open(&cli.config)?;

    match cli.command {
        Commands::Hook { hook, .. } => handle_hook(hook, ctx).await,
        Commands::Pki(cmd) => handle_pki(cmd, &ctx),
        Commands::Device(cmd) => handle_device(cmd, &ctx).await,
        Commands::Session(cmd) => handle_session(cmd, &ctx).await,
        Commands::Firewall(cmd) => handle_firewall(cmd, &ctx).await,
        Commands::Service(cmd) => handle_service(cmd, &ctx).await,
    }
}

async fn handle_hook(hook: Hook, ctx: Gate) -> Result<()> {
    let lifecycle = VpnLifecycle::new(ctx.config, ctx.settings, ctx.access);
    lifecycle
        .run(hook)
        .await
        .with_context(|| format!("hook {} failed", hook))
}

fn handle_pki(cmd: PkiCommands, ctx: &Gate) -> Result<()> {
    match cmd {
        PkiCommands::Init { force } => {
            if ctx.pki.has_certificate_authority() && !force {
                bail!("certificate authority already exists, use --force to replace it");
            }
            ctx.config.ensure_directories()?;

            let ca = ctx.pki.create_certificate_authority()?;
            info!("Certificate authority created ({})", ca.fingerprint()?);
            create_server_keys(&ctx.pki, ctx.settings.as_ref())?;
            ctx.settings.set_bool(keys::VPN_RESTART_PENDING, true)?;

            let entries = ctx.publisher().publish()?;
            println!("PKI initialised, CRL has {} entries", entries);
        }
        PkiCommands::Crl => {
            let publisher = ctx.publisher();
            let entries = publisher.publish()?;
            println!("Published {} entries to {}", entries, publisher.path().display());
        }
    }
    Ok(())
}

async fn handle_device(cmd: DeviceCommands, ctx: &Gate) -> Result<()> {
    match cmd {
        DeviceCommands::List => {
            let state = ctx.store.load()?;
            println!("{:<36}  {:<32}  {:<8}  LAST SEEN", "ID", "COMMON NAME", "ISSUED");
            for device in &state.devices {
                let cn = match state.user(device.user_id) {
                    Some(user) => device.common_name(user),
                    None => device.name.clone(),
                };
                let seen = device
                    .last_seen
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!("{:<36}  {:<32}  {:<8}  {}", device.id.to_string(), cn, device.is_issued(), seen);
            }
        }
        DeviceCommands::Add { user, name } => {
            let owner = ctx
                .store
                .load()?
                .user_by_email(&user)
                .map(|u| u.id)
                .with_context(|| format!("no user with email {}", user))?;
            let device = ctx.access.add_device(owner, &name)?;
            println!("{}", device.id);
        }
        DeviceCommands::Issue { id, output, linux } => {
            let profile = ClientConfig::from_settings(ctx.settings.as_ref(), linux)?;
            let keypair = ctx.access.issue_device_keypair(id)?;
            if let Err(e) = deliver_client_config(profile, &keypair, output.as_deref()).await {
                ctx.access.withdraw_device_keypair(id, &keypair)?;
                ctx.publisher().publish()?;
                return Err(e);
            }
        }
        DeviceCommands::Revoke { id } => {
            let device = ctx.access.delete_device(id).await?;
            let entries = ctx.publisher().publish()?;
            println!("Revoked device {}, CRL has {} entries", device.name, entries);
        }
    }
    Ok(())
}

/// Render a freshly issued client configuration to a file or stdout
async fn deliver_client_config(profile: ClientConfig, keypair: &KeyPair, output: Option<&Path>) -> Result<()> {
    let text = profile.with_keypair(keypair)?.render();
    match output {
        Some(path) => {
            write_secure_config(path, &text, 0o600).await?;
            println!("Client configuration written to {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

async fn handle_session(cmd: SessionCommands, ctx: &Gate) -> Result<()> {
    match cmd {
        SessionCommands::List => {
            let now = chrono::Utc::now();
            println!("{:<40}  {:<15}  {:<21}  DURATION", "COMMON NAME", "VIRTUAL IP", "REMOTE");
            for session in ctx.store.load()?.sessions {
                println!(
                    "{:<40}  {:<15}  {:<21}  {}",
                    session.common_name,
                    session.virtual_ip,
                    session.remote_addr,
                    libvpngate::model::format_duration(session.duration_secs(now))
                );
            }
        }
        SessionCommands::Kill { common_name } => match ctx.access.terminate_session(&common_name).await? {
            Some(session) => println!("Disconnected {} ({})", session.common_name, session.virtual_ip),
            None => bail!("no session named {}", common_name),
        },
    }
    Ok(())
}

async fn handle_firewall(cmd: FirewallCommands, ctx: &Gate) -> Result<()> {
    match cmd {
        FirewallCommands::Rebuild => {
            let groups = ctx.access.rebuild_all().await?;
            println!("Rebuilt {} group chains", groups);
        }
        FirewallCommands::Show => {
            let lines = ctx.settings.get_list(keys::VPN_FIREWALL_RULES);
            if lines.is_empty() {
                println!("No top-level rules installed");
            }
            for line in lines {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

async fn handle_service(cmd: ServiceCommands, ctx: &Gate) -> Result<()> {
    let service = VpnService::new(&ctx.config.vpn.service_unit);
    match cmd {
        ServiceCommands::Start => service.start().await?,
        ServiceCommands::Stop => service.stop().await?,
        ServiceCommands::Restart => service.restart().await?,
        ServiceCommands::Status => {
            if !service.is_running().await {
                bail!("{} is not running", service.unit());
            }
            println!("{} is running", service.unit());
        }
        ServiceCommands::Apply => {
            if service.restart_if_pending(ctx.settings.as_ref()).await? {
                println!("Restarted {}", service.unit());
            } else {
                println!("No restart pending");
            }
        }
    }
    Ok(())
}

/// Initialize logging based on command-line arguments
///
/// Logs go to stderr so client configurations can be piped from stdout.
fn init_logging(cli: &Cli) {
    let log_level = if cli.verbose { "debug" } else { &cli.log_level };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vpngate={},libvpngate={}", log_level, log_level)));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .init();
}
