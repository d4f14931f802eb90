//! Daemon configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vaultkeep_core::session::{Account, AccountToken};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    /// Relative paths are resolved against `data_dir`.
    pub database_file: PathBuf,
    pub settings_file: PathBuf,
    /// Used by accounts that do not name their own server.
    pub server_url: String,
    pub client_id: String,
    pub log_level: String,
    pub open_attempts: u32,
    pub poll_timeout_secs: u64,
    pub accounts: Vec<AccountConfig>,
}

/// Seed credentials for an account. Once a token has been refreshed the
/// stored account takes precedence over this entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default)]
    pub server_url: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    /// Unknown expiry is treated as already expired.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_file: PathBuf::from("vaultkeep.db"),
            settings_file: PathBuf::from("settings.json"),
            server_url: "https://vault.bitwarden.com".to_string(),
            client_id: "desktop".to_string(),
            log_level: "info".to_string(),
            open_attempts: 3,
            poll_timeout_secs: 60,
            accounts: Vec::new(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vaultkeep")
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database_file)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(&self.settings_file)
    }

    pub fn seed_accounts(&self) -> Vec<Account> {
        self.accounts
            .iter()
            .map(|a| Account {
                id: a.id.clone(),
                server_url: a.server_url.clone().unwrap_or_else(|| self.server_url.clone()),
                token: Some(AccountToken {
                    access_token: a.access_token.clone(),
                    refresh_token: a.refresh_token.clone(),
                    expiration_date: a.expires_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
                }),
            })
            .collect()
    }
}

/// Config accounts overlaid with the stored ones, keeping config order and
/// appending stored accounts the config does not mention.
pub fn merge_accounts(seed: Vec<Account>, stored: Vec<Account>) -> Vec<Account> {
    let mut merged: Vec<Account> = seed
        .into_iter()
        .map(|account| {
            stored
                .iter()
                .find(|s| s.id == account.id)
                .cloned()
                .unwrap_or(account)
        })
        .collect();
    for account in stored {
        if !merged.iter().any(|m| m.id == account.id) {
            merged.push(account);
        }
    }
    merged
}
