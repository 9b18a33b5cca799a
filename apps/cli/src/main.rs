//! PayPipe CLI
//!
//! Account management, relay mode and client mode.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use paypipe_client::Client;
use paypipe_crypto::KdfParams;
use paypipe_keystore::{AccountRecord, KeyVault};
use paypipe_logging::LogLevel;
use paypipe_relay::RelayServer;
use paypipe_settings::Settings;

/// PayPipe - pay-per-use relay network
#[derive(Parser)]
#[command(name = "paypipe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Account password
    #[arg(long, env = "PAYPIPE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the local account
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Run as a relay
    Serve {
        /// Listen address (overrides settings)
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Run the client: pick a relay, pay for it and serve a local SOCKS5 proxy
    Connect {
        /// Relay candidate, "address@host:port" (repeatable, overrides settings)
        #[arg(short, long)]
        service: Vec<String>,

        /// License text (overrides settings)
        #[arg(long)]
        license: Option<String>,

        /// Local SOCKS5 listen address (overrides settings)
        #[arg(short = 'L', long)]
        local: Option<String>,
    },
}

#[derive(Subcommand)]
enum AccountAction {
    /// Create a new account
    Create {
        /// Replace an existing account
        #[arg(long)]
        force: bool,
    },

    /// Show the account address
    Show {
        /// Print the full account record as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load_or_default(),
    }
    .context("Failed to load settings")?;

    let level = if cli.verbose > 0 {
        LogLevel::from_verbosity(cli.verbose)
    } else {
        LogLevel::from_str(&settings.log_level).unwrap_or_default()
    };
    paypipe_logging::init(level);

    match cli.command {
        Commands::Account { action } => match action {
            AccountAction::Create { force } => {
                create_account(&settings, cli.password.as_deref(), force)?;
            }
            AccountAction::Show { json } => {
                show_account(&settings, json)?;
            }
        },
        Commands::Serve { listen } => {
            serve(settings, cli.password.as_deref(), listen).await?;
        }
        Commands::Connect {
            service,
            license,
            local,
        } => {
            connect(settings, cli.password.as_deref(), service, license, local).await?;
        }
    }

    Ok(())
}

fn require_password(password: Option<&str>) -> Result<&str> {
    match password {
        Some(p) if !p.is_empty() => Ok(p),
        _ => bail!("Password required (--password or PAYPIPE_PASSWORD)"),
    }
}

fn load_account(settings: &Settings) -> Result<AccountRecord> {
    let path = settings.account_path();
    AccountRecord::load(&path)
        .with_context(|| format!("Failed to read account {:?}", path))?
        .with_context(|| format!("No account at {:?}, run `paypipe account create`", path))
}

// ============================================================================
// Account
// ============================================================================

fn create_account(settings: &Settings, password: Option<&str>, force: bool) -> Result<()> {
    let password = require_password(password)?;
    let path = settings.account_path();

    if !force && AccountRecord::load(&path)?.is_some() {
        bail!("Account already exists at {:?} (use --force to replace)", path);
    }

    let (vault, record) = KeyVault::create_account(password, KdfParams::default())?;
    record.save(&path)?;

    info!("Account saved to {:?}", path);
    println!("Created account {}", vault.address());
    Ok(())
}

fn show_account(settings: &Settings, json: bool) -> Result<()> {
    let path = settings.account_path();
    match AccountRecord::load(&path)? {
        Some(record) if json => println!("{}", serde_json::to_string_pretty(&record)?),
        Some(record) => println!("{}", record.address),
        None => println!("No account at {:?}", path),
    }
    Ok(())
}

// ============================================================================
// Relay mode
// ============================================================================

async fn serve(settings: Settings, password: Option<&str>, listen: Option<String>) -> Result<()> {
    let password = require_password(password)?;
    let record = load_account(&settings)?;

    let mut vault = KeyVault::from_record(&record)?;
    if !vault.unlock(password) {
        bail!("Wrong password for account {}", record.address);
    }

    let mut config = settings.server;
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }

    let mut server = RelayServer::bind(config, Arc::new(vault)).await?;
    server.start();
    println!("Relay {}@{}", server.address(), server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down relay...");
    server.stop();
    Ok(())
}

// ============================================================================
// Client mode
// ============================================================================

async fn connect(
    settings: Settings,
    password: Option<&str>,
    services: Vec<String>,
    license: Option<String>,
    local: Option<String>,
) -> Result<()> {
    let password = require_password(password)?;

    let mut config = settings.client.clone();
    if config.addr.is_empty() || config.cipher.is_empty() {
        let record = load_account(&settings)?;
        config.addr = record.address;
        config.cipher = record.cipher;
    }
    if !services.is_empty() {
        config.services = services;
    }
    if let Some(license) = license {
        config.license = license;
    }
    if let Some(local) = local {
        config.local_server = local;
    }

    let client = Client::new(&config, password).await?;
    println!(
        "SOCKS5 proxy on {} via {}",
        client.local_addr(),
        client.service()
    );

    let shutdown = client.shutdown_handle();
    let running = client.running();
    tokio::pin!(running);

    let outcome = tokio::select! {
        outcome = &mut running => outcome,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down client...");
            shutdown.shutdown();
            running.await
        }
    };

    if let Err(e) = &outcome {
        warn!("Session ended with {:?} error", e.class());
    }
    outcome.context("Client session failed")
}
