//! Key material types.
//!
//! Every type here owns secret bytes and wipes them when dropped.

use crate::crypto::{CryptoError, Result};
use serde::{Deserialize, Serialize};
use zeroize::{ZeroizeOnDrop, Zeroizing};

/// Version of the local master key derivation.
///
/// Keys derived for server accounts reuse these tags to name the algorithm
/// family only. Their costs come from the account's KDF parameters.
///
/// Raw values outside the known set are representable so a record written
/// by a newer client can be loaded and rejected with a typed error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MasterKdfVersion(i32);

impl MasterKdfVersion {
    /// PBKDF2-SHA256
    pub const V0: MasterKdfVersion = MasterKdfVersion(0);
    /// Argon2id
    pub const V1: MasterKdfVersion = MasterKdfVersion(1);
    pub const LATEST: MasterKdfVersion = MasterKdfVersion::V1;

    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> i32 {
        self.0
    }

    pub fn is_supported(&self) -> bool {
        matches!(*self, MasterKdfVersion::V0 | MasterKdfVersion::V1)
    }
}

/// The master key derived from a master password
///
/// It is held in memory only and should never be persisted, except for the
/// internal store key which is kept in the secure settings store.
#[derive(ZeroizeOnDrop)]
pub struct MasterKey {
    #[zeroize(skip)]
    version: MasterKdfVersion,
    key: Vec<u8>,
}

impl MasterKey {
    pub fn new(version: MasterKdfVersion, key: Vec<u8>) -> Self {
        Self { version, key }
    }

    pub fn version(&self) -> MasterKdfVersion {
        self.version
    }

    /// Get a reference to the key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

impl Clone for MasterKey {
    fn clone(&self) -> Self {
        Self::new(self.version, self.key.clone())
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("version", &self.version)
            .field("len", &self.key.len())
            .finish()
    }
}

/// A symmetric vault key.
///
/// 32 bytes is either a bare AES-256 key or an AES-128 key followed by a
/// 16 byte MAC key. 64 bytes is an AES-256 key followed by a 32 byte MAC key.
/// Which split applies is decided by the cipher type being used, never by
/// guessing from the length alone.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SymmetricCryptoKey {
    data: Vec<u8>,
}

impl SymmetricCryptoKey {
    pub const LEN_COMBINED: usize = 32;
    pub const LEN_WITH_MAC: usize = 64;

    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        match data.len() {
            Self::LEN_COMBINED | Self::LEN_WITH_MAC => Ok(Self { data }),
            got => Err(CryptoError::InvalidKeyLength {
                expected: Self::LEN_WITH_MAC,
                got,
            }),
        }
    }

    /// Builds a 64 byte key from separate encryption and MAC halves.
    pub fn from_parts(enc_key: &[u8], mac_key: &[u8]) -> Result<Self> {
        if enc_key.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                got: enc_key.len(),
            });
        }
        if mac_key.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                got: mac_key.len(),
            });
        }
        let mut data = Vec::with_capacity(Self::LEN_WITH_MAC);
        data.extend_from_slice(enc_key);
        data.extend_from_slice(mac_key);
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn has_mac_key(&self) -> bool {
        self.data.len() == Self::LEN_WITH_MAC
    }

    /// Encryption half of a 64 byte key.
    pub fn enc_key(&self) -> Option<&[u8]> {
        self.has_mac_key().then(|| &self.data[..32])
    }

    /// MAC half of a 64 byte key.
    pub fn mac_key(&self) -> Option<&[u8]> {
        self.has_mac_key().then(|| &self.data[32..])
    }
}

impl std::fmt::Debug for SymmetricCryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricCryptoKey")
            .field("len", &self.data.len())
            .finish()
    }
}

/// RSA key used by the asymmetric envelope types.
///
/// Private keys are PKCS#8 DER, public keys are SubjectPublicKeyInfo DER,
/// which is what the server hands out for user and organization keys.
#[derive(Clone)]
pub enum AsymmetricCryptoKey {
    Private(Zeroizing<Vec<u8>>),
    Public(Vec<u8>),
}

impl AsymmetricCryptoKey {
    pub fn private_der(der: Vec<u8>) -> Self {
        AsymmetricCryptoKey::Private(Zeroizing::new(der))
    }

    pub fn public_der(der: Vec<u8>) -> Self {
        AsymmetricCryptoKey::Public(der)
    }

    pub fn is_private(&self) -> bool {
        matches!(self, AsymmetricCryptoKey::Private(_))
    }
}

impl std::fmt::Debug for AsymmetricCryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsymmetricCryptoKey::Private(_) => f.write_str("AsymmetricCryptoKey::Private(..)"),
            AsymmetricCryptoKey::Public(der) => {
                write!(f, "AsymmetricCryptoKey::Public({} bytes)", der.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symmetric_key_lengths() {
        assert!(SymmetricCryptoKey::from_bytes(vec![0u8; 32]).is_ok());
        assert!(SymmetricCryptoKey::from_bytes(vec![0u8; 64]).is_ok());
        assert!(matches!(
            SymmetricCryptoKey::from_bytes(vec![0u8; 48]),
            Err(CryptoError::InvalidKeyLength { got: 48, .. })
        ));
    }

    #[test]
    fn test_symmetric_key_halves() {
        let key = SymmetricCryptoKey::from_parts(&[1u8; 32], &[2u8; 32]).unwrap();
        assert_eq!(key.enc_key().unwrap(), &[1u8; 32]);
        assert_eq!(key.mac_key().unwrap(), &[2u8; 32]);

        let combined = SymmetricCryptoKey::from_bytes(vec![3u8; 32]).unwrap();
        assert!(combined.mac_key().is_none());
    }

    #[test]
    fn test_kdf_version_support() {
        assert!(MasterKdfVersion::V0.is_supported());
        assert!(MasterKdfVersion::V1.is_supported());
        assert!(!MasterKdfVersion::from_raw(999).is_supported());
        assert_eq!(MasterKdfVersion::from_raw(1), MasterKdfVersion::V1);
    }

    #[test]
    fn test_debug_does_not_leak() {
        let key = MasterKey::new(MasterKdfVersion::V0, vec![0xAB; 32]);
        let out = format!("{:?}", key);
        assert!(!out.contains("171"));
        assert!(!out.to_lowercase().contains("ab, "));
    }
}
