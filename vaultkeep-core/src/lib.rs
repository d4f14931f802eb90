//! Vaultkeep Core Library
//!
//! This library provides the core of the vault client: the cipher codec and
//! key derivation, key pair handling, the three-way merge engine, the
//! encrypted local store and the notifications reconciler that decides when
//! an account must be re-synced.

pub mod crypto;
pub mod database;
pub mod merge;
pub mod models;
pub mod session;

pub use crypto::cipher::{decode, decode_string, encode, encode_string, CipherEnvelope, CipherType};
pub use crypto::kdf::{derive_master_key, derive_sub_keys, KdfConfig, KdfType};
pub use crypto::keys::{AsymmetricCryptoKey, MasterKdfVersion, MasterKey, SymmetricCryptoKey};
pub use crypto::{CryptoError, CryptoResult};
pub use database::{Database, DatabaseError, DatabaseManager};
pub use merge::{merge, merge_into_remote, DiffFinderNode, Lens};
pub use session::{NotificationsReconciler, SessionError};

use thiserror::Error;

/// Result type for vault core operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// General error type for vault core operations
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] database::DatabaseError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VaultError {
    /// Stable message key for the UI layer.
    ///
    /// Errors that need a different remediation from the user get their own
    /// key; everything else collapses into `error_generic`.
    pub fn user_message(&self) -> &'static str {
        match self {
            VaultError::Crypto(e) => e.user_message(),
            VaultError::Database(DatabaseError::Crypto(e)) => e.user_message(),
            VaultError::Database(_) => "error_database",
            VaultError::Session(SessionError::Unauthorized) => "error_session_expired",
            VaultError::Session(_) => "error_network",
            VaultError::InvalidInput(_) | VaultError::Io(_) => "error_generic",
        }
    }
}
