//! RSA and Ed25519 key pairs.
//!
//! Private keys are kept as PKCS#8 DER, public keys in the SSH wire format
//! (`string type, ...`), which is what `ssh-keygen` fingerprints.

use crate::crypto::{CryptoError, Result};
use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
    Engine,
};
use ed25519_dalek::SigningKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const SSH_RSA: &str = "ssh-rsa";
const SSH_ED25519: &str = "ssh-ed25519";

/// Key pair algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPairType {
    Rsa,
    Ed25519,
}

impl KeyPairType {
    pub fn ssh_name(&self) -> &'static str {
        match self {
            KeyPairType::Rsa => SSH_RSA,
            KeyPairType::Ed25519 => SSH_ED25519,
        }
    }
}

/// Permitted RSA modulus sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RsaLength {
    B1024,
    B2048,
    #[default]
    B4096,
}

impl RsaLength {
    pub fn from_bits(bits: usize) -> Result<Self> {
        match bits {
            1024 => Ok(RsaLength::B1024),
            2048 => Ok(RsaLength::B2048),
            4096 => Ok(RsaLength::B4096),
            other => Err(CryptoError::UnsupportedKeySize(other)),
        }
    }

    pub fn bits(&self) -> usize {
        match self {
            RsaLength::B1024 => 1024,
            RsaLength::B2048 => 2048,
            RsaLength::B4096 => 4096,
        }
    }
}

/// Key material as generated or parsed, before the derived
/// representations are computed.
#[derive(Clone)]
pub struct KeyPairRaw {
    pub key_type: KeyPairType,
    /// PKCS#8 DER
    pub private_key: Zeroizing<Vec<u8>>,
    /// SSH wire encoding; derived from the private key when absent
    pub public_key: Option<Vec<u8>>,
}

impl std::fmt::Debug for KeyPairRaw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairRaw")
            .field("key_type", &self.key_type)
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key.as_ref().map(Vec::len))
            .finish()
    }
}

/// Public half with its display forms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyParameter {
    pub encoded: Vec<u8>,
    /// `ssh-ed25519 AAAA...`
    pub ssh: String,
    /// `SHA256:...`
    pub fingerprint: String,
}

/// Private half with its display forms
#[derive(Clone)]
pub struct PrivateKeyParameter {
    pub encoded: Zeroizing<Vec<u8>>,
    /// PKCS#8 PEM
    pub pem: Zeroizing<String>,
    pub fingerprint: String,
}

/// A fully populated key pair
#[derive(Clone)]
pub struct KeyPair {
    pub key_type: KeyPairType,
    pub public_key: PublicKeyParameter,
    pub private_key: PrivateKeyParameter,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_type", &self.key_type)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Generate an RSA key pair with public exponent 65537
pub fn generate_rsa(length: RsaLength) -> Result<KeyPairRaw> {
    let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, length.bits())
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("RSA generation failed: {}", e)))?;
    let public_key = rsa_public_wire(&private);
    Ok(KeyPairRaw {
        key_type: KeyPairType::Rsa,
        private_key: rsa_to_der(&private)?,
        public_key: Some(public_key),
    })
}

/// Generate an RSA key pair from a bit count, rejecting sizes other than
/// 1024, 2048 and 4096.
pub fn generate_rsa_bits(bits: usize) -> Result<KeyPairRaw> {
    generate_rsa(RsaLength::from_bits(bits)?)
}

pub fn generate_ed25519() -> Result<KeyPairRaw> {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    Ok(KeyPairRaw {
        key_type: KeyPairType::Ed25519,
        private_key: ed25519_to_der(&signing_key)?,
        public_key: Some(ed25519_public_wire(&signing_key)),
    })
}

/// Parse a PEM private key together with its `ssh-*` public key line.
///
/// The key type comes from the public line. Errors only carry the PEM
/// header, never key bytes.
pub fn parse(private_pem: &str, public_ssh: &str) -> Result<KeyPairRaw> {
    let header = pem_header(private_pem);
    let invalid = |what: &str| {
        CryptoError::InvalidKeyMaterial(format!(
            "{} ({})",
            what,
            header.as_deref().unwrap_or("no PEM header")
        ))
    };

    let encoded_public = public_ssh
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| invalid("public key line has no key data"))?;
    let public_wire = STANDARD
        .decode(encoded_public)
        .map_err(|_| invalid("public key is not valid base64"))?;
    let key_type = match read_ssh_string(&public_wire, 0).map(|(name, _)| name) {
        Some(name) if name == SSH_RSA.as_bytes() => KeyPairType::Rsa,
        Some(name) if name == SSH_ED25519.as_bytes() => KeyPairType::Ed25519,
        _ => return Err(invalid("unsupported public key type")),
    };

    let (private_der, derived_public) = match key_type {
        KeyPairType::Rsa => {
            let private = RsaPrivateKey::from_pkcs8_pem(private_pem)
                .or_else(|_| RsaPrivateKey::from_pkcs1_pem(private_pem))
                .map_err(|_| invalid("can not decode RSA private key"))?;
            (rsa_to_der(&private)?, rsa_public_wire(&private))
        }
        KeyPairType::Ed25519 => {
            let signing_key = SigningKey::from_pkcs8_pem(private_pem)
                .map_err(|_| invalid("can not decode Ed25519 private key"))?;
            (ed25519_to_der(&signing_key)?, ed25519_public_wire(&signing_key))
        }
    };
    if derived_public != public_wire {
        return Err(invalid("public key does not belong to the private key"));
    }

    Ok(KeyPairRaw {
        key_type,
        private_key: private_der,
        public_key: Some(public_wire),
    })
}

/// Compute the public key, SSH line, PEM and fingerprints of a raw key
/// pair. Works from the private key alone.
pub fn populate(raw: &KeyPairRaw) -> Result<KeyPair> {
    let (public_wire, pem) = match raw.key_type {
        KeyPairType::Rsa => {
            let private = RsaPrivateKey::from_pkcs8_der(&raw.private_key)
                .map_err(|e| CryptoError::InvalidKeyMaterial(format!("RSA private key: {}", e)))?;
            let pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
            (rsa_public_wire(&private), pem)
        }
        KeyPairType::Ed25519 => {
            let signing_key = SigningKey::from_pkcs8_der(&raw.private_key).map_err(|e| {
                CryptoError::InvalidKeyMaterial(format!("Ed25519 private key: {}", e))
            })?;
            let pem = signing_key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
            (ed25519_public_wire(&signing_key), pem)
        }
    };
    let public_wire = raw.public_key.clone().unwrap_or(public_wire);

    let public_key = PublicKeyParameter {
        ssh: format!("{} {}", raw.key_type.ssh_name(), STANDARD.encode(&public_wire)),
        fingerprint: fingerprint(&public_wire),
        encoded: public_wire,
    };
    let private_key = PrivateKeyParameter {
        fingerprint: fingerprint(&raw.private_key),
        encoded: raw.private_key.clone(),
        pem: Zeroizing::new(pem.to_string()),
    };
    Ok(KeyPair {
        key_type: raw.key_type,
        public_key,
        private_key,
    })
}

/// RSA modulus size in bits, or `None` when the private key is not RSA or
/// does not parse. Never fails.
pub fn private_key_length(raw: &KeyPairRaw) -> Option<usize> {
    match raw.key_type {
        KeyPairType::Rsa => RsaPrivateKey::from_pkcs8_der(&raw.private_key)
            .ok()
            .map(|key| key.n().bits()),
        KeyPairType::Ed25519 => None,
    }
}

/// `SHA256:<base64>` as printed by `ssh-keygen -E sha256 -l`
pub fn fingerprint(data: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(data)))
}

fn pem_header(pem: &str) -> Option<String> {
    pem.lines()
        .find(|line| line.starts_with("-----BEGIN "))
        .map(|line| line.trim_matches('-').to_string())
}

fn rsa_to_der(private: &RsaPrivateKey) -> Result<Zeroizing<Vec<u8>>> {
    let der = private
        .to_pkcs8_der()
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    Ok(Zeroizing::new(der.as_bytes().to_vec()))
}

fn ed25519_to_der(signing_key: &SigningKey) -> Result<Zeroizing<Vec<u8>>> {
    let der = signing_key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
    Ok(Zeroizing::new(der.as_bytes().to_vec()))
}

fn rsa_public_wire(private: &RsaPrivateKey) -> Vec<u8> {
    let mut out = Vec::new();
    write_ssh_string(&mut out, SSH_RSA.as_bytes());
    write_ssh_mpint(&mut out, private.e());
    write_ssh_mpint(&mut out, private.n());
    out
}

fn ed25519_public_wire(signing_key: &SigningKey) -> Vec<u8> {
    let mut out = Vec::new();
    write_ssh_string(&mut out, SSH_ED25519.as_bytes());
    write_ssh_string(&mut out, signing_key.verifying_key().as_bytes());
    out
}

fn write_ssh_string(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
}

fn write_ssh_mpint(out: &mut Vec<u8>, value: &BigUint) {
    let bytes = value.to_bytes_be();
    let trimmed: &[u8] = match bytes.iter().position(|b| *b != 0) {
        Some(start) => &bytes[start..],
        None => &[],
    };
    if trimmed.first().is_some_and(|b| b & 0x80 != 0) {
        let mut padded = Vec::with_capacity(trimmed.len() + 1);
        padded.push(0);
        padded.extend_from_slice(trimmed);
        write_ssh_string(out, &padded);
    } else {
        write_ssh_string(out, trimmed);
    }
}

fn read_ssh_string(data: &[u8], offset: usize) -> Option<(&[u8], usize)> {
    let len_bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let start = offset + 4;
    let value = data.get(start..start.checked_add(len)?)?;
    Some((value, start + len))
}
