//! Cryptographic primitives for the vault client.
//!
//! This module provides:
//! - PBKDF2 / Argon2id / HKDF key derivation
//! - The versioned cipher envelope codec (AES-CBC + HMAC, RSA-OAEP)
//! - RSA and Ed25519 key pair generation and parsing
//! - Key types that zeroize on drop

pub mod cipher;
pub mod generator;
pub mod kdf;
pub mod keypair;
pub mod keys;
pub mod master;

pub use cipher::{decode, encode, CipherEnvelope, CipherType};
pub use generator::{Argon2Mode, CryptoGenerator, DefaultCryptoGenerator};
pub use kdf::{derive_master_key, derive_sub_keys, KdfConfig, KdfType};
pub use keys::{AsymmetricCryptoKey, MasterKdfVersion, MasterKey, SymmetricCryptoKey};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Unsupported KDF version: {0}")]
    UnsupportedKdfVersion(i32),

    #[error("Invalid KDF parameters: {0}")]
    InvalidKdfParams(String),

    #[error("Not enough memory to derive the key ({memory_kb} KiB requested)")]
    OutOfMemoryKdf { memory_kb: u64 },

    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Authentication failed - data may have been tampered with or the key is wrong")]
    AuthenticationFailed,

    #[error("Malformed cipher envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Unsupported cipher type: {0}")]
    UnsupportedCipherType(String),

    #[error("Key does not fit cipher type {cipher_type}: {reason}")]
    KeyTypeMismatch { cipher_type: u8, reason: String },

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Unsupported key size: {0} bits")]
    UnsupportedKeySize(usize),

    #[error("Master password does not match")]
    PasswordMismatch,
}

impl CryptoError {
    /// Message key shown to the user. Wrong-password style failures and a
    /// device that can not afford the KDF memory need different remediation.
    pub fn user_message(&self) -> &'static str {
        match self {
            CryptoError::AuthenticationFailed => "error_authentication_failed",
            CryptoError::PasswordMismatch => "error_incorrect_password",
            CryptoError::OutOfMemoryKdf { .. } => "error_kdf_out_of_memory",
            CryptoError::UnsupportedKdfVersion(_) => "error_kdf_unsupported",
            _ => "error_crypto",
        }
    }
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
/// Alias for Result used outside the crypto module
pub type CryptoResult<T> = Result<T>;
