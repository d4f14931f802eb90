//! Vaultkeep sync daemon
//!
//! Keeps a notifications connection open for every configured account and
//! queues a re-sync into the encrypted store whenever the server pushes a
//! change.

mod config;

use anyhow::Context;
use clap::Parser;
use config::{merge_accounts, DaemonConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use vaultkeep_core::database::{DatabaseManager, DatabaseManagerConfig, FileSettings};
use vaultkeep_core::session::token::ACCOUNT_KIND;
use vaultkeep_core::session::{
    Account, HttpNotificationsHub, HttpTokenRefresher, NotificationsReconciler,
    PersistingTokenRefresher, StoreSyncQueue, WatchConnectivity,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "vaultkeep-daemon", about = "Vaultkeep background sync daemon")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "vaultkeep.toml")]
    config: PathBuf,

    /// Data directory override
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Default server URL override
    #[arg(short, long)]
    server_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        DaemonConfig::load(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        DaemonConfig::default()
    };
    if let Some(data_dir) = cli.data_dir {
        cfg.data_dir = data_dir;
    }
    if let Some(server_url) = cli.server_url {
        cfg.server_url = server_url;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(cfg.log_level.parse()?))
        .init();

    tracing::info!("Starting vaultkeep daemon v{}", VERSION);
    if !cli.config.exists() {
        tracing::info!("No config file found, using defaults");
    }

    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("Failed to create {}", cfg.data_dir.display()))?;

    let settings = FileSettings::new(cfg.settings_path());
    let manager = Arc::new(DatabaseManager::with_settings(
        DatabaseManagerConfig {
            path: Some(cfg.database_path()),
            open_attempts: cfg.open_attempts,
        },
        &settings,
    )?);

    let stored: Vec<Account> = manager.get().await?.list(ACCOUNT_KIND)?;
    let accounts = merge_accounts(cfg.seed_accounts(), stored);
    if accounts.is_empty() {
        tracing::warn!("No accounts configured; waiting for shutdown");
    }
    tracing::info!("Watching {} account(s)", accounts.len());
    let (accounts_tx, accounts_rx) = watch::channel(accounts);

    let refresher = PersistingTokenRefresher::new(
        Arc::new(HttpTokenRefresher::new(&cfg.client_id)?),
        Arc::clone(&manager),
        accounts_tx,
    );
    // No platform connectivity signal; treat the network as always up.
    let (_online, connectivity) = WatchConnectivity::channel(true);

    let reconciler = NotificationsReconciler::new(
        accounts_rx,
        Arc::new(HttpNotificationsHub::new(Duration::from_secs(cfg.poll_timeout_secs))?),
        Arc::new(refresher),
        Arc::new(connectivity),
        Arc::new(StoreSyncQueue::new(Arc::clone(&manager))),
    );
    let handle = reconciler.launch();

    tracing::info!("Daemon ready. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    handle.abort();
    let _ = handle.await;
    Ok(())
}
