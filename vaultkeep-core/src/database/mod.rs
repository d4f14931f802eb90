//! Encrypted local store.
//!
//! [`Database`] is the SQLite handle whose rows are sealed with the store's
//! own master key, [`DatabaseManager`] owns that key's lifecycle and
//! serializes every writer behind one lock.

pub mod manager;
pub mod schema;
pub mod settings;

pub use manager::{DatabaseManager, DatabaseManagerConfig};
pub use schema::Database;
pub use settings::{FileSettings, MemorySettings, SecureSettings};

use crate::crypto::CryptoError;
use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Settings error: {0}")]
    Settings(String),

    /// The file exists but the key does not open it.
    #[error("File is not a database or the key is wrong")]
    NotADatabase,

    #[error("Failed to open the database after {attempts} attempts: {last_error}")]
    OpenFailed { attempts: u32, last_error: String },

    #[error("Database task failed: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatabaseError {
    /// Whether the store file is unreadable with the current key, either as
    /// reported by SQLite or by the key check row.
    pub fn is_not_a_database(&self) -> bool {
        match self {
            DatabaseError::NotADatabase => true,
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::NotADatabase
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(e: serde_json::Error) -> Self {
        DatabaseError::Serialization(e.to_string())
    }
}
