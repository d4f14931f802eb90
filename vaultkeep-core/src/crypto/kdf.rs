//! Key derivation for server accounts.
//!
//! The server tells the client which KDF to run in its pre-login response:
//! - PBKDF2-HMAC-SHA256 with the lowercased email as salt
//! - Argon2id with the SHA-256 of the lowercased email as salt
//!
//! The resulting master key never leaves the device. It is stretched with
//! HKDF-Expand into independent encryption and MAC keys, and hashed once
//! more with PBKDF2 into the value that is sent to the server at login.

use crate::crypto::generator::{Argon2Mode, CryptoGenerator, DefaultCryptoGenerator};
use crate::crypto::keys::{MasterKdfVersion, MasterKey, SymmetricCryptoKey};
use crate::crypto::{CryptoError, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Length of every derived master key
pub const MASTER_KEY_LEN: usize = 32;

const MIB_IN_KIB: u32 = 1024;

/// KDF selected by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfType {
    Pbkdf2Sha256,
    Argon2id,
}

impl KdfType {
    pub fn from_raw(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(KdfType::Pbkdf2Sha256),
            1 => Ok(KdfType::Argon2id),
            other => Err(CryptoError::UnsupportedKdfVersion(other)),
        }
    }

    pub fn raw(&self) -> i32 {
        match self {
            KdfType::Pbkdf2Sha256 => 0,
            KdfType::Argon2id => 1,
        }
    }
}

/// KDF parameter record as it arrives in the pre-login response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfConfig {
    #[serde(alias = "kdf")]
    pub kdf_type: i32,

    #[serde(alias = "kdfIterations")]
    pub iterations: u32,

    /// Argon2id memory cost in MiB
    #[serde(default, alias = "kdfMemory")]
    pub memory_mb: Option<u32>,

    /// Argon2id lanes
    #[serde(default, alias = "kdfParallelism")]
    pub parallelism: Option<u32>,
}

impl KdfConfig {
    pub fn pbkdf2(iterations: u32) -> Self {
        Self {
            kdf_type: KdfType::Pbkdf2Sha256.raw(),
            iterations,
            memory_mb: None,
            parallelism: None,
        }
    }

    pub fn argon2id(iterations: u32, memory_mb: u32, parallelism: u32) -> Self {
        Self {
            kdf_type: KdfType::Argon2id.raw(),
            iterations,
            memory_mb: Some(memory_mb),
            parallelism: Some(parallelism),
        }
    }

    pub fn kdf(&self) -> Result<KdfType> {
        KdfType::from_raw(self.kdf_type)
    }

    /// Verify that the fields required by the KDF type are present and sane
    pub fn validate(&self) -> Result<KdfType> {
        let kdf = self.kdf()?;
        if self.iterations < 1 {
            return Err(CryptoError::InvalidKdfParams(
                "Iterations too low (minimum: 1)".to_string(),
            ));
        }
        if kdf == KdfType::Argon2id {
            match self.memory_mb {
                None => {
                    return Err(CryptoError::InvalidKdfParams(
                        "Argon2id requires a memory cost".to_string(),
                    ))
                }
                Some(0) => {
                    return Err(CryptoError::InvalidKdfParams(
                        "Memory cost too low (minimum: 1 MiB)".to_string(),
                    ))
                }
                Some(_) => {}
            }
            match self.parallelism {
                None => {
                    return Err(CryptoError::InvalidKdfParams(
                        "Argon2id requires a parallelism".to_string(),
                    ))
                }
                Some(0) => {
                    return Err(CryptoError::InvalidKdfParams(
                        "Parallelism too low (minimum: 1)".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(kdf)
    }
}

/// Normalizes an account email into the byte string used as KDF salt.
pub fn email_salt(email: &str) -> Vec<u8> {
    email.trim().to_lowercase().into_bytes()
}

/// Derive a master key from a password
///
/// # Arguments
/// * `password` - The master password as bytes
/// * `salt` - The account salt, see [`email_salt`]
/// * `kdf` - KDF parameters from the pre-login response
///
/// # Returns
/// A 32-byte master key. Its [`MasterKdfVersion`] only names the algorithm
/// family, V0 for PBKDF2-SHA256 and V1 for Argon2id. The cost parameters
/// come from `kdf`, not from the fixed costs the local store pipeline
/// attaches to those tags, so a server key can not be re-derived from its
/// tag alone.
pub fn derive_master_key(password: &[u8], salt: &[u8], kdf: &KdfConfig) -> Result<MasterKey> {
    derive_master_key_with(&DefaultCryptoGenerator, password, salt, kdf)
}

/// [`derive_master_key`] over an explicit generator.
pub fn derive_master_key_with(
    generator: &dyn CryptoGenerator,
    password: &[u8],
    salt: &[u8],
    kdf: &KdfConfig,
) -> Result<MasterKey> {
    match kdf.validate()? {
        KdfType::Pbkdf2Sha256 => {
            let key = generator.pbkdf2(password, salt, kdf.iterations, MASTER_KEY_LEN)?;
            Ok(MasterKey::new(MasterKdfVersion::V0, key))
        }
        KdfType::Argon2id => {
            // validate() guarantees both are present
            let memory_mb = kdf.memory_mb.unwrap_or_default();
            let parallelism = kdf.parallelism.unwrap_or_default();
            // A cost beyond what Argon2 can address is one no device can afford.
            let memory_kb = memory_mb.checked_mul(MIB_IN_KIB).ok_or(CryptoError::OutOfMemoryKdf {
                memory_kb: u64::from(memory_mb) * u64::from(MIB_IN_KIB),
            })?;
            let hashed_salt = generator.hash_sha256(salt);
            let key = generator.argon2(
                Argon2Mode::Argon2id,
                password,
                &hashed_salt,
                kdf.iterations,
                memory_kb,
                parallelism,
            )?;
            Ok(MasterKey::new(MasterKdfVersion::V1, key))
        }
    }
}

/// Stretch a master key into a 64 byte encryption + MAC key.
///
/// The master key is used directly as the HKDF pseudo-random key, the two
/// halves are expanded with the `enc` and `mac` info strings.
pub fn derive_sub_keys(master_key: &MasterKey) -> Result<SymmetricCryptoKey> {
    derive_sub_keys_with(&DefaultCryptoGenerator, master_key)
}

pub fn derive_sub_keys_with(
    generator: &dyn CryptoGenerator,
    master_key: &MasterKey,
) -> Result<SymmetricCryptoKey> {
    let enc = Zeroizing::new(generator.hkdf_expand(master_key.as_bytes(), b"enc", 32)?);
    let mac = Zeroizing::new(generator.hkdf_expand(master_key.as_bytes(), b"mac", 32)?);
    SymmetricCryptoKey::from_parts(&enc, &mac)
}

/// Hash that proves knowledge of the master password to the server.
///
/// PBKDF2-SHA256 with the master key as password, the master password as
/// salt and a single iteration, base64 encoded.
pub fn master_password_hash(master_key: &MasterKey, password: &[u8]) -> Result<String> {
    let hash = Zeroizing::new(DefaultCryptoGenerator.pbkdf2(
        master_key.as_bytes(),
        password,
        1,
        MASTER_KEY_LEN,
    )?);
    Ok(STANDARD.encode(hash.as_slice()))
}

/// Verify a master password against a stored master password hash
///
/// Uses constant-time comparison on the decoded hash bytes.
pub fn verify_master_password_hash(
    master_key: &MasterKey,
    password: &[u8],
    expected_hash: &str,
) -> Result<()> {
    let expected = STANDARD
        .decode(expected_hash)
        .map_err(|_| CryptoError::PasswordMismatch)?;
    let actual = Zeroizing::new(DefaultCryptoGenerator.pbkdf2(
        master_key.as_bytes(),
        password,
        1,
        MASTER_KEY_LEN,
    )?);

    if actual.as_slice().ct_eq(expected.as_slice()).into() {
        Ok(())
    } else {
        Err(CryptoError::PasswordMismatch)
    }
}

/// Derive a 64 byte key from random key material for shared objects such
/// as sends, using `bitwarden-<name>` as HKDF salt.
pub fn derive_shared_key(seed: &[u8], name: &str, info: &str) -> Result<SymmetricCryptoKey> {
    let salt = format!("bitwarden-{}", name);
    let key = Zeroizing::new(DefaultCryptoGenerator.hkdf(
        seed,
        Some(salt.as_bytes()),
        Some(info.as_bytes()),
        SymmetricCryptoKey::LEN_WITH_MAC,
    )?);
    SymmetricCryptoKey::from_bytes(key.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generator::testing::{Argon2Call, RecordingCryptoGenerator};

    #[test]
    fn test_kdf_config_from_prelogin_json() {
        let json = r#"{"kdf":1,"kdfIterations":3,"kdfMemory":64,"kdfParallelism":4}"#;
        let config: KdfConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, KdfConfig::argon2id(3, 64, 4));

        let json = r#"{"kdfType":0,"iterations":600000}"#;
        let config: KdfConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config, KdfConfig::pbkdf2(600_000));
    }

    #[test]
    fn test_kdf_config_validation() {
        assert!(KdfConfig::pbkdf2(1).validate().is_ok());
        assert!(KdfConfig::pbkdf2(0).validate().is_err());

        let mut config = KdfConfig::argon2id(3, 64, 4);
        config.memory_mb = None;
        assert!(matches!(config.validate(), Err(CryptoError::InvalidKdfParams(_))));

        let mut config = KdfConfig::argon2id(3, 64, 4);
        config.parallelism = Some(0);
        assert!(matches!(config.validate(), Err(CryptoError::InvalidKdfParams(_))));
    }

    #[test]
    fn test_unsupported_kdf_type() {
        let config = KdfConfig {
            kdf_type: 7,
            iterations: 1,
            memory_mb: None,
            parallelism: None,
        };
        let result = derive_master_key(b"pw", b"salt", &config);
        assert!(matches!(result, Err(CryptoError::UnsupportedKdfVersion(7))));
    }

    #[test]
    fn test_pbkdf2_master_key_deterministic() {
        let salt = email_salt("  User@Example.com ");
        assert_eq!(salt, b"user@example.com");

        let config = KdfConfig::pbkdf2(5_000);
        let key1 = derive_master_key(b"hunter2", &salt, &config).unwrap();
        let key2 = derive_master_key(b"hunter2", &salt, &config).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
        assert_eq!(key1.as_bytes().len(), MASTER_KEY_LEN);
        assert_eq!(key1.version(), MasterKdfVersion::V0);

        // Different salt should produce different key
        let key3 = derive_master_key(b"hunter2", b"other@example.com", &config).unwrap();
        assert_ne!(key1.as_bytes(), key3.as_bytes());

        // Different iterations should produce different key
        let key4 = derive_master_key(b"hunter2", &salt, &KdfConfig::pbkdf2(5_001)).unwrap();
        assert_ne!(key1.as_bytes(), key4.as_bytes());
    }

    #[test]
    fn test_argon2id_uses_mib_and_hashed_salt() {
        let generator = RecordingCryptoGenerator::default();
        let key = derive_master_key_with(
            &generator,
            b"hunter2",
            b"user@example.com",
            &KdfConfig::argon2id(3, 64, 4),
        )
        .unwrap();

        assert_eq!(key.version(), MasterKdfVersion::V1);
        assert!(generator.pbkdf2_calls.lock().unwrap().is_empty());
        assert_eq!(
            generator.argon2_calls.lock().unwrap().as_slice(),
            &[Argon2Call {
                mode: Argon2Mode::Argon2id,
                iterations: 3,
                memory_kb: 64 * 1024,
                parallelism: 4,
            }]
        );
    }

    #[test]
    fn test_server_key_tag_names_algorithm_not_costs() {
        let generator = RecordingCryptoGenerator::default();
        let pbkdf2 =
            derive_master_key_with(&generator, b"pw", b"a@b.c", &KdfConfig::pbkdf2(1)).unwrap();
        let argon2 =
            derive_master_key_with(&generator, b"pw", b"a@b.c", &KdfConfig::argon2id(7, 2, 3))
                .unwrap();

        assert_eq!(pbkdf2.version(), MasterKdfVersion::V0);
        assert_eq!(argon2.version(), MasterKdfVersion::V1);
        assert_eq!(generator.pbkdf2_calls.lock().unwrap()[0].iterations, 1);
        let argon2_call = generator.argon2_calls.lock().unwrap()[0].clone();
        assert_eq!(
            (argon2_call.iterations, argon2_call.memory_kb, argon2_call.parallelism),
            (7, 2 * 1024, 3)
        );
    }

    #[test]
    fn test_unaffordable_argon2id_memory_is_typed() {
        let salt = email_salt("a@b.c");
        let result = derive_master_key(b"pw", &salt, &KdfConfig::argon2id(1, 4_000_000, 1));
        assert!(matches!(result, Err(CryptoError::OutOfMemoryKdf { .. })));

        // Past the Argon2 addressable range
        let result = derive_master_key(b"pw", &salt, &KdfConfig::argon2id(1, u32::MAX, 1));
        match result {
            Err(CryptoError::OutOfMemoryKdf { memory_kb }) => {
                assert_eq!(memory_kb, u64::from(u32::MAX) * 1024)
            }
            _ => panic!("expected OutOfMemoryKdf"),
        }
    }

    #[test]
    fn test_argon2id_master_key_real() {
        let config = KdfConfig::argon2id(1, 1, 1);
        let key1 = derive_master_key(b"pw", b"a@b.c", &config).unwrap();
        let key2 = derive_master_key(b"pw", b"a@b.c", &config).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_sub_keys_are_independent() {
        let master = MasterKey::new(MasterKdfVersion::V0, vec![9u8; 32]);
        let keys = derive_sub_keys(&master).unwrap();
        assert_eq!(keys.len(), 64);
        assert_ne!(keys.enc_key().unwrap(), keys.mac_key().unwrap());
        assert_ne!(keys.enc_key().unwrap(), master.as_bytes());
    }

    #[test]
    fn test_master_password_hash_verification() {
        let master = derive_master_key(b"hunter2", b"user@example.com", &KdfConfig::pbkdf2(1_000)).unwrap();
        let hash = master_password_hash(&master, b"hunter2").unwrap();

        assert!(verify_master_password_hash(&master, b"hunter2", &hash).is_ok());
        assert!(matches!(
            verify_master_password_hash(&master, b"hunter3", &hash),
            Err(CryptoError::PasswordMismatch)
        ));
        assert!(verify_master_password_hash(&master, b"hunter2", "not base64!").is_err());
    }

    #[test]
    fn test_shared_key_derivation() {
        let a = derive_shared_key(&[1u8; 16], "send", "send").unwrap();
        let b = derive_shared_key(&[1u8; 16], "send", "send").unwrap();
        let c = derive_shared_key(&[2u8; 16], "send", "send").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
        assert!(a.has_mac_key());
    }
}
