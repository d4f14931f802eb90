//! Lifecycle of the encrypted store: key loading, opening with retries and
//! the single-writer lock.

use super::schema::Database;
use super::settings::SecureSettings;
use super::{DatabaseError, Result};
use crate::crypto::generator::{CryptoGenerator, DefaultCryptoGenerator};
use crate::crypto::keys::{MasterKdfVersion, MasterKey};
use crate::crypto::master::{generate_master_hash, generate_master_key, generate_master_salt};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Settings key holding the store's master key.
pub const DATABASE_KEY_SETTING: &str = "database_key";

/// Length of the random password the store key is derived from.
const STORE_PASSWORD_LEN: usize = 32;

/// The store key is never shown to a user, so the oldest KDF is enough.
const STORE_KDF_VERSION: MasterKdfVersion = MasterKdfVersion::V0;

/// Shared by every manager in the process, so a manager built after a
/// password change still waits for writers of the previous one.
fn mutation_lock() -> Arc<Mutex<()>> {
    static MUTATION_LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    Arc::clone(MUTATION_LOCK.get_or_init(Default::default))
}

/// Held for the duration of one mutation; logs the release however the
/// mutation ends.
struct MutationGuard<'a> {
    tag: &'a str,
    _guard: OwnedMutexGuard<()>,
}

impl<'a> MutationGuard<'a> {
    async fn acquire(tag: &'a str) -> MutationGuard<'a> {
        debug!("Adding '{}' database lock.", tag);
        let guard = mutation_lock().lock_owned().await;
        MutationGuard { tag, _guard: guard }
    }
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        debug!("Removing '{}' database lock.", self.tag);
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseManagerConfig {
    /// Database file; `None` keeps the store in memory.
    pub path: Option<PathBuf>,
    /// How many times opening is attempted before giving up.
    pub open_attempts: u32,
}

impl Default for DatabaseManagerConfig {
    fn default() -> Self {
        Self {
            path: None,
            open_attempts: 3,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    version: i32,
    key: String,
}

/// Owns the open store and serializes writers.
pub struct DatabaseManager {
    config: DatabaseManagerConfig,
    master_key: MasterKey,
    db: OnceCell<Arc<Database>>,
}

impl DatabaseManager {
    /// Create a manager bound to `master_key`. Nothing is opened until the
    /// first call to [`DatabaseManager::get`].
    pub fn new(config: DatabaseManagerConfig, master_key: MasterKey) -> Self {
        Self {
            config,
            master_key,
            db: OnceCell::new(),
        }
    }

    /// Create a manager whose key is loaded from `settings`, generating and
    /// saving one on first run.
    pub fn with_settings(config: DatabaseManagerConfig, settings: &dyn SecureSettings) -> Result<Self> {
        let master_key = load_or_create_key(settings, &DefaultCryptoGenerator)?;
        Ok(Self::new(config, master_key))
    }

    /// The open store, opening it on first use.
    pub async fn get(&self) -> Result<Arc<Database>> {
        self.db
            .get_or_try_init(|| self.open_with_retry())
            .await
            .map(Arc::clone)
    }

    /// Run `block` against the store while holding the process-wide write
    /// lock. Blocks never interleave, even across manager instances.
    ///
    /// # Arguments
    /// * `tag` - Caller name, only used for logging
    /// * `block` - The work to run; its error is returned as is
    pub async fn mutate<T, F, Fut>(&self, tag: &str, block: F) -> Result<T>
    where
        F: FnOnce(Arc<Database>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let db = self.get().await?;
        let _guard = MutationGuard::acquire(tag).await;
        block(db).await
    }

    /// Re-encrypt the store under `new_master_key`.
    ///
    /// Waits for in-flight mutations and keeps the lock for the whole
    /// re-encryption. The work runs to completion even if the caller is
    /// cancelled, and the lock is released only when it has. The caller must
    /// persist the new key and bind any later manager to it.
    pub async fn change_password(&self, new_master_key: &MasterKey) -> Result<()> {
        let db = self.get().await?;
        let guard = mutation_lock().lock_owned().await;
        debug!("Adding 'ChangePassword' database lock.");
        let new_master_key = new_master_key.clone();
        tokio::task::spawn_blocking(move || {
            let result = db.change_password(&new_master_key);
            debug!("Removing 'ChangePassword' database lock.");
            drop(guard);
            result
        })
        .await
        .map_err(|e| DatabaseError::Task(e.to_string()))??;
        info!("Database password changed");
        Ok(())
    }

    async fn open_with_retry(&self) -> Result<Arc<Database>> {
        let attempts = self.config.open_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let path = self.config.path.clone();
            let master_key = self.master_key.clone();
            let result = tokio::task::spawn_blocking(move || open_once(path.as_deref(), &master_key))
                .await
                .map_err(|e| DatabaseError::Task(e.to_string()))
                .and_then(|result| result);

            match result {
                Ok(db) => {
                    debug!("Database opened on attempt {}", attempt);
                    return Ok(Arc::new(db));
                }
                Err(e) => {
                    warn!("Failed to open database (attempt {}/{}): {}", attempt, attempts, e);
                    last_error = e.to_string();
                    if attempt < attempts {
                        sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    }
                }
            }
        }

        Err(DatabaseError::OpenFailed {
            attempts,
            last_error,
        })
    }
}

/// Opens the store once. A file that the key can not read is deleted and
/// created afresh; the store only caches server data.
fn open_once(path: Option<&Path>, master_key: &MasterKey) -> Result<Database> {
    let path = match path {
        Some(path) => path,
        None => return Database::in_memory(master_key),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match Database::open(path, master_key) {
        Err(e) if e.is_not_a_database() => {
            warn!("Database at {} is unreadable with the current key, recreating it", path.display());
            std::fs::remove_file(path)?;
            Database::open(path, master_key)
        }
        other => other,
    }
}

/// Load the store key from `settings`, or derive and save a new one.
///
/// A new key comes from a random password and salt through the local
/// master key pipeline, pinned at [`MasterKdfVersion::V0`].
pub fn load_or_create_key(
    settings: &dyn SecureSettings,
    generator: &dyn CryptoGenerator,
) -> Result<MasterKey> {
    if let Some(stored) = settings.get_string(DATABASE_KEY_SETTING)? {
        let stored: StoredKey = serde_json::from_str(&stored)?;
        let key = BASE64
            .decode(&stored.key)
            .map_err(|e| DatabaseError::Settings(format!("Invalid {}: {}", DATABASE_KEY_SETTING, e)))?;
        return Ok(MasterKey::new(MasterKdfVersion::from_raw(stored.version), key));
    }

    let password = Zeroizing::new(generator.seed(STORE_PASSWORD_LEN));
    let salt = generate_master_salt(generator);
    let hash = generate_master_hash(generator, &password, &salt, STORE_KDF_VERSION)?;
    let key = generate_master_key(generator, &password, &hash)?;
    save_key(settings, &key)?;
    info!("Generated a new database key");
    Ok(key)
}

/// Persist `key` as the store key.
pub fn save_key(settings: &dyn SecureSettings, key: &MasterKey) -> Result<()> {
    let stored = StoredKey {
        version: key.version().raw(),
        key: BASE64.encode(key.as_bytes()),
    };
    let json = Zeroizing::new(serde_json::to_string(&stored)?);
    settings.put_string(DATABASE_KEY_SETTING, Some(json.as_str()))
}
