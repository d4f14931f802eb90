//! Local master password pipeline.
//!
//! Used for the app lock and for the internal store key:
//! password + random salt -> master hash (persisted) -> master key (memory only).
//! Both steps are versioned with [`MasterKdfVersion`].

use crate::crypto::generator::{Argon2Mode, CryptoGenerator};
use crate::crypto::keys::{MasterKdfVersion, MasterKey};
use crate::crypto::{CryptoError, Result};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;

pub const MASTER_SALT_LEN: usize = 64;
const MASTER_LEN: usize = 32;

const V0_HASH_ITERATIONS: u32 = 100_000;
const V0_KEY_ITERATIONS: u32 = 10_000;

const V1_ITERATIONS: u32 = 3;
const V1_MEMORY_KB: u32 = 65_536;
const V1_PARALLELISM: u32 = 4;

/// Random salt stored next to the master hash
#[derive(Clone, Serialize, Deserialize)]
pub struct MasterPasswordSalt(pub Vec<u8>);

/// Persisted proof of the master password
#[derive(Clone, Serialize, Deserialize)]
pub struct MasterPasswordHash {
    pub version: MasterKdfVersion,
    pub hash: Vec<u8>,
}

pub fn generate_master_salt(generator: &dyn CryptoGenerator) -> MasterPasswordSalt {
    MasterPasswordSalt(generator.seed(MASTER_SALT_LEN))
}

pub fn generate_master_hash(
    generator: &dyn CryptoGenerator,
    password: &[u8],
    salt: &MasterPasswordSalt,
    version: MasterKdfVersion,
) -> Result<MasterPasswordHash> {
    let hash = match version {
        MasterKdfVersion::V0 => generator.pbkdf2(password, &salt.0, V0_HASH_ITERATIONS, MASTER_LEN)?,
        MasterKdfVersion::V1 => argon2_v1(generator, password, &salt.0)?,
        other => return Err(CryptoError::UnsupportedKdfVersion(other.raw())),
    };
    Ok(MasterPasswordHash { version, hash })
}

/// Derives the master key, salted with the master hash. The key inherits
/// the hash's version.
pub fn generate_master_key(
    generator: &dyn CryptoGenerator,
    password: &[u8],
    hash: &MasterPasswordHash,
) -> Result<MasterKey> {
    let key = match hash.version {
        MasterKdfVersion::V0 => generator.pbkdf2(password, &hash.hash, V0_KEY_ITERATIONS, MASTER_LEN)?,
        MasterKdfVersion::V1 => argon2_v1(generator, password, &hash.hash)?,
        other => return Err(CryptoError::UnsupportedKdfVersion(other.raw())),
    };
    debug!("Generated master key with KDF version {}", hash.version.raw());
    Ok(MasterKey::new(hash.version, key))
}

/// Checks a password against the persisted hash and returns its master key.
///
/// An unsupported version is reported as a mismatch: the user can not do
/// anything about it other than entering a different password.
pub fn confirm_master_key(
    generator: &dyn CryptoGenerator,
    password: &[u8],
    salt: &MasterPasswordSalt,
    expected: &MasterPasswordHash,
) -> Result<MasterKey> {
    let actual = generate_master_hash(generator, password, salt, expected.version)
        .map_err(map_unsupported)?;
    let actual_hash = Zeroizing::new(actual.hash.clone());
    if !bool::from(actual_hash.as_slice().ct_eq(expected.hash.as_slice())) {
        return Err(CryptoError::PasswordMismatch);
    }
    generate_master_key(generator, password, &actual).map_err(map_unsupported)
}

fn map_unsupported(e: CryptoError) -> CryptoError {
    match e {
        CryptoError::UnsupportedKdfVersion(_) => CryptoError::PasswordMismatch,
        other => other,
    }
}

fn argon2_v1(generator: &dyn CryptoGenerator, password: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    generator.argon2(
        Argon2Mode::Argon2id,
        password,
        salt,
        V1_ITERATIONS,
        V1_MEMORY_KB,
        V1_PARALLELISM,
    )
}
