//! Database schema and connection management.
//!
//! Every row payload is serialized to JSON and sealed into an
//! `AesCbc256_HmacSha256_B64` envelope under a key stretched from the
//! store's master key, so nothing readable lands on disk.

use super::{DatabaseError, Result};
use crate::crypto::cipher::{self, CipherType};
use crate::crypto::kdf::derive_sub_keys;
use crate::crypto::keys::{MasterKey, SymmetricCryptoKey};
use crate::crypto::CryptoError;
use crate::models::VaultCipher;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Row kind used for vault ciphers.
pub const CIPHER_KIND: &str = "cipher";

const ROW_CIPHER_TYPE: CipherType = CipherType::AesCbc256HmacSha256B64;
const KEY_CHECK_PLAINTEXT: &[u8] = b"vaultkeep-key-check";

/// Main database connection and schema manager
pub struct Database {
    conn: Mutex<Connection>,
    key: RwLock<SymmetricCryptoKey>,
}

impl Database {
    /// Open a database at the specified path
    ///
    /// # Arguments
    /// * `path` - Database file, created when missing
    /// * `master_key` - The store's own master key
    ///
    /// # Returns
    /// `DatabaseError::NotADatabase` (or the equivalent SQLite failure) when
    /// the file exists but was written under a different key
    pub fn open<P: AsRef<Path>>(path: P, master_key: &MasterKey) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, master_key)
    }

    /// Create a new in-memory database for testing
    pub fn in_memory(master_key: &MasterKey) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, master_key)
    }

    fn with_connection(conn: Connection, master_key: &MasterKey) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;

        let db = Self {
            conn: Mutex::new(conn),
            key: RwLock::new(derive_sub_keys(master_key)?),
        };
        db.initialize_schema()?;
        db.verify_key()?;
        Ok(db)
    }

    /// Initialize the database schema
    pub fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS db_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                key_check TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_modified INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS entities (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (kind, id)
            );",
        )?;

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < CURRENT_SCHEMA_VERSION {
            conn.execute_batch(&format!("PRAGMA user_version = {}", CURRENT_SCHEMA_VERSION))?;
            debug!("Database schema bumped from {} to {}", version, CURRENT_SCHEMA_VERSION);
        }
        Ok(())
    }

    /// Schema version recorded in the file.
    pub fn schema_version(&self) -> Result<i32> {
        Ok(self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Writes the key check row on first open, validates it afterwards.
    fn verify_key(&self) -> Result<()> {
        let conn = self.conn();
        let key = self.key();
        let stored: Option<String> = conn
            .query_row("SELECT key_check FROM db_metadata WHERE id = 1", [], |row| row.get(0))
            .optional()?;

        match stored {
            Some(envelope) => {
                let plaintext = match cipher::decode(&envelope, Some(&key), None) {
                    Ok(plaintext) => plaintext,
                    Err(CryptoError::AuthenticationFailed) => return Err(DatabaseError::NotADatabase),
                    Err(e) => return Err(e.into()),
                };
                if plaintext != KEY_CHECK_PLAINTEXT {
                    return Err(DatabaseError::NotADatabase);
                }
            }
            None => {
                let now = chrono::Utc::now().timestamp();
                let envelope = cipher::encode(ROW_CIPHER_TYPE, KEY_CHECK_PLAINTEXT, Some(&key), None)?;
                conn.execute(
                    "INSERT INTO db_metadata (id, key_check, created_at, last_modified)
                     VALUES (1, ?1, ?2, ?2)",
                    params![envelope.to_string(), now],
                )?;
            }
        }
        Ok(())
    }

    /// Insert or replace the row `(kind, id)`.
    ///
    /// The row key is read while the connection is held, so a row is always
    /// sealed under the key the file is encrypted with.
    pub fn put<T: Serialize>(&self, kind: &str, id: &str, value: &T) -> Result<()> {
        let conn = self.conn();
        let data = seal(&self.key(), value)?;
        conn.execute(
            "INSERT OR REPLACE INTO entities (kind, id, data, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![kind, id, data, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<Option<T>> {
        let conn = self.conn();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM entities WHERE kind = ?1 AND id = ?2",
                params![kind, id],
                |row| row.get(0),
            )
            .optional()?;
        let key = self.key();
        data.map(|data| open_row(&key, &data)).transpose()
    }

    /// All rows of one kind, ordered by id.
    pub fn list<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let conn = self.conn();
        let rows: Vec<String> = {
            let mut stmt = conn.prepare("SELECT data FROM entities WHERE kind = ?1 ORDER BY id")?;
            let rows = stmt
                .query_map(params![kind], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            rows
        };
        let key = self.key();
        rows.iter().map(|data| open_row(&key, data)).collect()
    }

    /// Returns whether a row was removed.
    pub fn delete(&self, kind: &str, id: &str) -> Result<bool> {
        let removed = self.conn().execute(
            "DELETE FROM entities WHERE kind = ?1 AND id = ?2",
            params![kind, id],
        )?;
        Ok(removed > 0)
    }

    pub fn count(&self, kind: &str) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM entities WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn put_cipher(&self, cipher: &VaultCipher) -> Result<()> {
        self.put(CIPHER_KIND, &cipher_row_id(&cipher.account_id, &cipher.cipher_id), cipher)
    }

    pub fn get_cipher(&self, account_id: &str, cipher_id: &str) -> Result<Option<VaultCipher>> {
        self.get(CIPHER_KIND, &cipher_row_id(account_id, cipher_id))
    }

    pub fn ciphers_for_account(&self, account_id: &str) -> Result<Vec<VaultCipher>> {
        Ok(self
            .list::<VaultCipher>(CIPHER_KIND)?
            .into_iter()
            .filter(|cipher| cipher.account_id == account_id)
            .collect())
    }

    /// Re-encrypt every row under a key derived from `new_master_key`.
    ///
    /// Runs in a single transaction; the in-memory key is swapped only after
    /// the commit succeeds.
    pub fn change_password(&self, new_master_key: &MasterKey) -> Result<()> {
        let new_key = derive_sub_keys(new_master_key)?;

        let mut conn = self.conn();
        let old_key = self.key();
        let tx = conn.transaction()?;
        let rows: Vec<(String, String, String)> = {
            let mut stmt = tx.prepare("SELECT kind, id, data FROM entities")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        for (kind, id, data) in &rows {
            let plaintext = Zeroizing::new(cipher::decode(data, Some(&old_key), None)?);
            let sealed = cipher::encode(ROW_CIPHER_TYPE, &plaintext, Some(&new_key), None)?;
            tx.execute(
                "UPDATE entities SET data = ?1 WHERE kind = ?2 AND id = ?3",
                params![sealed.to_string(), kind, id],
            )?;
        }

        let check = cipher::encode(ROW_CIPHER_TYPE, KEY_CHECK_PLAINTEXT, Some(&new_key), None)?;
        tx.execute(
            "UPDATE db_metadata SET key_check = ?1, last_modified = ?2 WHERE id = 1",
            params![check.to_string(), chrono::Utc::now().timestamp()],
        )?;
        tx.commit()?;

        *self.key.write().unwrap_or_else(PoisonError::into_inner) = new_key;
        info!("Re-encrypted {} database rows with the new key", rows.len());
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Callers hold the connection guard while using the returned key;
    /// the key is only swapped under that guard.
    fn key(&self) -> SymmetricCryptoKey {
        self.key.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

fn seal<T: Serialize>(key: &SymmetricCryptoKey, value: &T) -> Result<String> {
    let json = Zeroizing::new(serde_json::to_vec(value)?);
    let envelope = cipher::encode(ROW_CIPHER_TYPE, &json, Some(key), None)?;
    Ok(envelope.to_string())
}

fn open_row<T: DeserializeOwned>(key: &SymmetricCryptoKey, data: &str) -> Result<T> {
    let json = Zeroizing::new(cipher::decode(data, Some(key), None)?);
    Ok(serde_json::from_slice(&json)?)
}

fn cipher_row_id(account_id: &str, cipher_id: &str) -> String {
    format!("{}/{}", account_id, cipher_id)
}
