//! Cipher envelope codec.
//!
//! Every encrypted vault field travels as a text envelope:
//!
//! ```text
//! <type>.<segment>[|<segment>...]
//! ```
//!
//! where each segment is standard base64 and the leading type digit alone
//! decides the algorithm and the segment layout:
//!
//! | type | algorithm                         | segments        |
//! |------|-----------------------------------|-----------------|
//! | 0    | AES-256-CBC                       | iv, data        |
//! | 1    | AES-128-CBC + HMAC-SHA256         | iv, data, mac   |
//! | 2    | AES-256-CBC + HMAC-SHA256         | iv, data, mac   |
//! | 3    | RSA-OAEP-SHA256                   | data            |
//! | 4    | RSA-OAEP-SHA1                     | data            |
//! | 5    | RSA-OAEP-SHA256 + HMAC-SHA256     | data, mac       |
//! | 6    | RSA-OAEP-SHA1 + HMAC-SHA256       | data, mac       |
//!
//! AES uses PKCS7 padding and a fresh random 16 byte IV per encryption. The
//! MAC of the AES types covers `iv || data`, the MAC of the RSA types covers
//! `data`. MACs are checked in constant time before any decryption happens.

use crate::crypto::keys::{AsymmetricCryptoKey, SymmetricCryptoKey};
use crate::crypto::{CryptoError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub const IV_LEN: usize = 16;
pub const MAC_LEN: usize = 32;

/// Algorithm selector carried as the first character of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherType {
    AesCbc256B64,
    AesCbc128HmacSha256B64,
    AesCbc256HmacSha256B64,
    Rsa2048OaepSha256B64,
    Rsa2048OaepSha1B64,
    Rsa2048OaepSha256HmacSha256B64,
    Rsa2048OaepSha1HmacSha256B64,
}

impl CipherType {
    pub const ALL: [CipherType; 7] = [
        CipherType::AesCbc256B64,
        CipherType::AesCbc128HmacSha256B64,
        CipherType::AesCbc256HmacSha256B64,
        CipherType::Rsa2048OaepSha256B64,
        CipherType::Rsa2048OaepSha1B64,
        CipherType::Rsa2048OaepSha256HmacSha256B64,
        CipherType::Rsa2048OaepSha1HmacSha256B64,
    ];

    pub fn from_raw(raw: u8) -> Result<Self> {
        Self::ALL
            .get(raw as usize)
            .copied()
            .ok_or_else(|| CryptoError::UnsupportedCipherType(raw.to_string()))
    }

    pub fn raw(&self) -> u8 {
        match self {
            CipherType::AesCbc256B64 => 0,
            CipherType::AesCbc128HmacSha256B64 => 1,
            CipherType::AesCbc256HmacSha256B64 => 2,
            CipherType::Rsa2048OaepSha256B64 => 3,
            CipherType::Rsa2048OaepSha1B64 => 4,
            CipherType::Rsa2048OaepSha256HmacSha256B64 => 5,
            CipherType::Rsa2048OaepSha1HmacSha256B64 => 6,
        }
    }

    /// Number of `|` separated segments after the type prefix
    pub fn segment_count(&self) -> usize {
        match self {
            CipherType::AesCbc256B64 => 2,
            CipherType::AesCbc128HmacSha256B64 | CipherType::AesCbc256HmacSha256B64 => 3,
            CipherType::Rsa2048OaepSha256B64 | CipherType::Rsa2048OaepSha1B64 => 1,
            CipherType::Rsa2048OaepSha256HmacSha256B64
            | CipherType::Rsa2048OaepSha1HmacSha256B64 => 2,
        }
    }

    pub fn is_asymmetric(&self) -> bool {
        self.raw() >= 3
    }

    pub fn has_mac(&self) -> bool {
        !matches!(
            self,
            CipherType::AesCbc256B64
                | CipherType::Rsa2048OaepSha256B64
                | CipherType::Rsa2048OaepSha1B64
        )
    }
}

/// A parsed envelope. Each variant only carries the segments its type has.
#[derive(Clone, PartialEq, Eq)]
pub enum CipherEnvelope {
    AesCbc256 { iv: [u8; IV_LEN], data: Vec<u8> },
    AesCbc128Hmac { iv: [u8; IV_LEN], data: Vec<u8>, mac: [u8; MAC_LEN] },
    AesCbc256Hmac { iv: [u8; IV_LEN], data: Vec<u8>, mac: [u8; MAC_LEN] },
    RsaOaepSha256 { data: Vec<u8> },
    RsaOaepSha1 { data: Vec<u8> },
    RsaOaepSha256Hmac { data: Vec<u8>, mac: [u8; MAC_LEN] },
    RsaOaepSha1Hmac { data: Vec<u8>, mac: [u8; MAC_LEN] },
}

impl CipherEnvelope {
    pub fn cipher_type(&self) -> CipherType {
        match self {
            CipherEnvelope::AesCbc256 { .. } => CipherType::AesCbc256B64,
            CipherEnvelope::AesCbc128Hmac { .. } => CipherType::AesCbc128HmacSha256B64,
            CipherEnvelope::AesCbc256Hmac { .. } => CipherType::AesCbc256HmacSha256B64,
            CipherEnvelope::RsaOaepSha256 { .. } => CipherType::Rsa2048OaepSha256B64,
            CipherEnvelope::RsaOaepSha1 { .. } => CipherType::Rsa2048OaepSha1B64,
            CipherEnvelope::RsaOaepSha256Hmac { .. } => CipherType::Rsa2048OaepSha256HmacSha256B64,
            CipherEnvelope::RsaOaepSha1Hmac { .. } => CipherType::Rsa2048OaepSha1HmacSha256B64,
        }
    }

    /// Parse an envelope string.
    ///
    /// The type digit fixes the segment count; anything that does not fit
    /// exactly is rejected before a key is ever touched.
    pub fn parse(input: &str) -> Result<Self> {
        let (type_part, body) = input
            .split_once('.')
            .ok_or_else(|| CryptoError::MalformedEnvelope("missing type prefix".to_string()))?;
        if body.contains('.') {
            return Err(CryptoError::MalformedEnvelope(
                "more than one type separator".to_string(),
            ));
        }
        if type_part.is_empty() || !type_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CryptoError::MalformedEnvelope(format!(
                "invalid type prefix '{}'",
                type_part
            )));
        }
        let raw: u8 = type_part
            .parse()
            .map_err(|_| CryptoError::UnsupportedCipherType(type_part.to_string()))?;
        let cipher_type = CipherType::from_raw(raw)?;

        let segments: Vec<&str> = body.split('|').collect();
        if segments.len() != cipher_type.segment_count() {
            return Err(CryptoError::MalformedEnvelope(format!(
                "type {} expects {} segments, got {}",
                raw,
                cipher_type.segment_count(),
                segments.len()
            )));
        }
        let segments = segments
            .into_iter()
            .map(decode_segment)
            .collect::<Result<Vec<_>>>()?;

        let envelope = match cipher_type {
            CipherType::AesCbc256B64 => CipherEnvelope::AesCbc256 {
                iv: fixed(&segments[0], "iv")?,
                data: segments[1].clone(),
            },
            CipherType::AesCbc128HmacSha256B64 => CipherEnvelope::AesCbc128Hmac {
                iv: fixed(&segments[0], "iv")?,
                data: segments[1].clone(),
                mac: fixed(&segments[2], "mac")?,
            },
            CipherType::AesCbc256HmacSha256B64 => CipherEnvelope::AesCbc256Hmac {
                iv: fixed(&segments[0], "iv")?,
                data: segments[1].clone(),
                mac: fixed(&segments[2], "mac")?,
            },
            CipherType::Rsa2048OaepSha256B64 => CipherEnvelope::RsaOaepSha256 {
                data: segments[0].clone(),
            },
            CipherType::Rsa2048OaepSha1B64 => CipherEnvelope::RsaOaepSha1 {
                data: segments[0].clone(),
            },
            CipherType::Rsa2048OaepSha256HmacSha256B64 => CipherEnvelope::RsaOaepSha256Hmac {
                data: segments[0].clone(),
                mac: fixed(&segments[1], "mac")?,
            },
            CipherType::Rsa2048OaepSha1HmacSha256B64 => CipherEnvelope::RsaOaepSha1Hmac {
                data: segments[0].clone(),
                mac: fixed(&segments[1], "mac")?,
            },
        };
        Ok(envelope)
    }

    fn segments(&self) -> Vec<&[u8]> {
        match self {
            CipherEnvelope::AesCbc256 { iv, data } => vec![&iv[..], &data[..]],
            CipherEnvelope::AesCbc128Hmac { iv, data, mac }
            | CipherEnvelope::AesCbc256Hmac { iv, data, mac } => {
                vec![&iv[..], &data[..], &mac[..]]
            }
            CipherEnvelope::RsaOaepSha256 { data } | CipherEnvelope::RsaOaepSha1 { data } => {
                vec![&data[..]]
            }
            CipherEnvelope::RsaOaepSha256Hmac { data, mac }
            | CipherEnvelope::RsaOaepSha1Hmac { data, mac } => vec![&data[..], &mac[..]],
        }
    }
}

impl fmt::Display for CipherEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.", self.cipher_type().raw())?;
        for (i, segment) in self.segments().into_iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            f.write_str(&STANDARD.encode(segment))?;
        }
        Ok(())
    }
}

impl fmt::Debug for CipherEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CipherEnvelope({})", self)
    }
}

impl FromStr for CipherEnvelope {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn decode_segment(segment: &str) -> Result<Vec<u8>> {
    if segment.is_empty() {
        return Err(CryptoError::MalformedEnvelope("empty segment".to_string()));
    }
    STANDARD
        .decode(segment)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("invalid base64: {}", e)))
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| {
        CryptoError::MalformedEnvelope(format!("{} must be {} bytes, got {}", what, N, bytes.len()))
    })
}

/// Encrypt `plaintext` into an envelope of the given type
///
/// # Arguments
/// * `cipher_type` - Selects the algorithm and the envelope layout
/// * `plaintext` - The data to encrypt
/// * `sym_key` - Required for the AES types and the HMAC-wrapped RSA types
/// * `asym_key` - Required for the RSA types; a private key is accepted and
///   its public half is used
///
/// # Security
/// - A fresh random IV is generated for every AES encryption
/// - The key must fit the requested type exactly, see [`SymmetricCryptoKey`]
pub fn encode(
    cipher_type: CipherType,
    plaintext: &[u8],
    sym_key: Option<&SymmetricCryptoKey>,
    asym_key: Option<&AsymmetricCryptoKey>,
) -> Result<CipherEnvelope> {
    let envelope = match cipher_type {
        CipherType::AesCbc256B64 => {
            let key = require_sym(cipher_type, sym_key)?;
            let iv = random_iv();
            let data = aes256_encrypt(aes256_only_key(cipher_type, key)?, &iv, plaintext)?;
            CipherEnvelope::AesCbc256 { iv, data }
        }
        CipherType::AesCbc128HmacSha256B64 => {
            let (enc, mac_key) = aes128_hmac_keys(cipher_type, require_sym(cipher_type, sym_key)?)?;
            let iv = random_iv();
            let data = Aes128CbcEnc::new_from_slices(enc, &iv)
                .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
            let mac = compute_mac(mac_key, &[&iv[..], &data[..]])?;
            CipherEnvelope::AesCbc128Hmac { iv, data, mac }
        }
        CipherType::AesCbc256HmacSha256B64 => {
            let (enc, mac_key) = aes256_hmac_keys(cipher_type, require_sym(cipher_type, sym_key)?)?;
            let iv = random_iv();
            let data = aes256_encrypt(enc, &iv, plaintext)?;
            let mac = compute_mac(mac_key, &[&iv[..], &data[..]])?;
            CipherEnvelope::AesCbc256Hmac { iv, data, mac }
        }
        CipherType::Rsa2048OaepSha256B64 => CipherEnvelope::RsaOaepSha256 {
            data: rsa_encrypt(cipher_type, require_asym(cipher_type, asym_key)?, plaintext)?,
        },
        CipherType::Rsa2048OaepSha1B64 => CipherEnvelope::RsaOaepSha1 {
            data: rsa_encrypt(cipher_type, require_asym(cipher_type, asym_key)?, plaintext)?,
        },
        CipherType::Rsa2048OaepSha256HmacSha256B64 => {
            let mac_key = rsa_mac_key(cipher_type, sym_key)?;
            let data = rsa_encrypt(cipher_type, require_asym(cipher_type, asym_key)?, plaintext)?;
            let mac = compute_mac(mac_key, &[&data[..]])?;
            CipherEnvelope::RsaOaepSha256Hmac { data, mac }
        }
        CipherType::Rsa2048OaepSha1HmacSha256B64 => {
            let mac_key = rsa_mac_key(cipher_type, sym_key)?;
            let data = rsa_encrypt(cipher_type, require_asym(cipher_type, asym_key)?, plaintext)?;
            let mac = compute_mac(mac_key, &[&data[..]])?;
            CipherEnvelope::RsaOaepSha1Hmac { data, mac }
        }
    };
    Ok(envelope)
}

/// Decrypt a parsed envelope
///
/// # Security
/// - For MAC'd types the MAC is verified in constant time first; on
///   mismatch `AuthenticationFailed` is returned and nothing is decrypted
/// - A key that does not fit the envelope's type is rejected, the type is
///   never re-guessed from the key
pub fn decrypt(
    envelope: &CipherEnvelope,
    sym_key: Option<&SymmetricCryptoKey>,
    asym_key: Option<&AsymmetricCryptoKey>,
) -> Result<Vec<u8>> {
    let cipher_type = envelope.cipher_type();
    match envelope {
        CipherEnvelope::AesCbc256 { iv, data } => {
            let key = require_sym(cipher_type, sym_key)?;
            aes256_decrypt(aes256_only_key(cipher_type, key)?, iv, data)
        }
        CipherEnvelope::AesCbc128Hmac { iv, data, mac } => {
            let (enc, mac_key) = aes128_hmac_keys(cipher_type, require_sym(cipher_type, sym_key)?)?;
            verify_mac(mac_key, &[&iv[..], &data[..]], mac)?;
            Aes128CbcDec::new_from_slices(enc, iv)
                .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(data)
                .map_err(|_| CryptoError::DecryptionFailed("invalid padding".to_string()))
        }
        CipherEnvelope::AesCbc256Hmac { iv, data, mac } => {
            let (enc, mac_key) = aes256_hmac_keys(cipher_type, require_sym(cipher_type, sym_key)?)?;
            verify_mac(mac_key, &[&iv[..], &data[..]], mac)?;
            aes256_decrypt(enc, iv, data)
        }
        CipherEnvelope::RsaOaepSha256 { data } | CipherEnvelope::RsaOaepSha1 { data } => {
            rsa_decrypt(cipher_type, require_asym(cipher_type, asym_key)?, data)
        }
        CipherEnvelope::RsaOaepSha256Hmac { data, mac }
        | CipherEnvelope::RsaOaepSha1Hmac { data, mac } => {
            let mac_key = rsa_mac_key(cipher_type, sym_key)?;
            verify_mac(mac_key, &[&data[..]], mac)?;
            rsa_decrypt(cipher_type, require_asym(cipher_type, asym_key)?, data)
        }
    }
}

/// Parse and decrypt an envelope string
pub fn decode(
    envelope: &str,
    sym_key: Option<&SymmetricCryptoKey>,
    asym_key: Option<&AsymmetricCryptoKey>,
) -> Result<Vec<u8>> {
    decrypt(&CipherEnvelope::parse(envelope)?, sym_key, asym_key)
}

/// Encrypt a UTF-8 string straight to its envelope text
pub fn encode_string(
    cipher_type: CipherType,
    plaintext: &str,
    sym_key: Option<&SymmetricCryptoKey>,
    asym_key: Option<&AsymmetricCryptoKey>,
) -> Result<String> {
    Ok(encode(cipher_type, plaintext.as_bytes(), sym_key, asym_key)?.to_string())
}

/// Decode an envelope whose plaintext is UTF-8
pub fn decode_string(
    envelope: &str,
    sym_key: Option<&SymmetricCryptoKey>,
    asym_key: Option<&AsymmetricCryptoKey>,
) -> Result<String> {
    let bytes = decode(envelope, sym_key, asym_key)?;
    String::from_utf8(bytes)
        .map_err(|_| CryptoError::DecryptionFailed("plaintext is not valid UTF-8".to_string()))
}

fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    iv
}

fn mismatch(cipher_type: CipherType, reason: impl Into<String>) -> CryptoError {
    CryptoError::KeyTypeMismatch {
        cipher_type: cipher_type.raw(),
        reason: reason.into(),
    }
}

fn require_sym(
    cipher_type: CipherType,
    key: Option<&SymmetricCryptoKey>,
) -> Result<&SymmetricCryptoKey> {
    key.ok_or_else(|| mismatch(cipher_type, "a symmetric key is required"))
}

fn require_asym(
    cipher_type: CipherType,
    key: Option<&AsymmetricCryptoKey>,
) -> Result<&AsymmetricCryptoKey> {
    key.ok_or_else(|| mismatch(cipher_type, "an RSA key is required"))
}

/// Type 0 uses the whole 32 byte key, or the encryption half of a 64 byte
/// key as older clients do.
fn aes256_only_key(cipher_type: CipherType, key: &SymmetricCryptoKey) -> Result<&[u8]> {
    match key.len() {
        SymmetricCryptoKey::LEN_COMBINED => Ok(key.as_bytes()),
        SymmetricCryptoKey::LEN_WITH_MAC => Ok(&key.as_bytes()[..32]),
        got => Err(mismatch(cipher_type, format!("unexpected key length {}", got))),
    }
}

fn aes128_hmac_keys(cipher_type: CipherType, key: &SymmetricCryptoKey) -> Result<(&[u8], &[u8])> {
    if key.len() != SymmetricCryptoKey::LEN_COMBINED {
        return Err(mismatch(cipher_type, "expected a 32 byte key"));
    }
    let bytes = key.as_bytes();
    Ok((&bytes[..16], &bytes[16..]))
}

fn aes256_hmac_keys(cipher_type: CipherType, key: &SymmetricCryptoKey) -> Result<(&[u8], &[u8])> {
    match (key.enc_key(), key.mac_key()) {
        (Some(enc), Some(mac)) => Ok((enc, mac)),
        _ => Err(mismatch(cipher_type, "expected a 64 byte key with a MAC half")),
    }
}

fn rsa_mac_key(cipher_type: CipherType, key: Option<&SymmetricCryptoKey>) -> Result<&[u8]> {
    require_sym(cipher_type, key)?
        .mac_key()
        .ok_or_else(|| mismatch(cipher_type, "expected a 64 byte key with a MAC half"))
}

fn aes256_encrypt(key: &[u8], iv: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    Ok(Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn aes256_decrypt(key: &[u8], iv: &[u8; IV_LEN], data: &[u8]) -> Result<Vec<u8>> {
    Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| CryptoError::DecryptionFailed("invalid padding".to_string()))
}

fn compute_mac(key: &[u8], parts: &[&[u8]]) -> Result<[u8; MAC_LEN]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("HMAC key: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn verify_mac(key: &[u8], parts: &[&[u8]], expected: &[u8; MAC_LEN]) -> Result<()> {
    let actual = compute_mac(key, parts)?;
    if actual[..].ct_eq(&expected[..]).into() {
        Ok(())
    } else {
        Err(CryptoError::AuthenticationFailed)
    }
}

fn oaep(cipher_type: CipherType) -> Oaep {
    match cipher_type {
        CipherType::Rsa2048OaepSha256B64 | CipherType::Rsa2048OaepSha256HmacSha256B64 => {
            Oaep::new::<Sha256>()
        }
        _ => Oaep::new::<Sha1>(),
    }
}

fn rsa_encrypt(cipher_type: CipherType, key: &AsymmetricCryptoKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let public = match key {
        AsymmetricCryptoKey::Public(der) => RsaPublicKey::from_public_key_der(der)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("RSA public key: {}", e)))?,
        AsymmetricCryptoKey::Private(der) => RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("RSA private key: {}", e)))?
            .to_public_key(),
    };
    public
        .encrypt(&mut rand::rngs::OsRng, oaep(cipher_type), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))
}

fn rsa_decrypt(cipher_type: CipherType, key: &AsymmetricCryptoKey, data: &[u8]) -> Result<Vec<u8>> {
    let der = match key {
        AsymmetricCryptoKey::Private(der) => der,
        AsymmetricCryptoKey::Public(_) => {
            return Err(mismatch(cipher_type, "decryption needs the private key"))
        }
    };
    let private = RsaPrivateKey::from_pkcs8_der(der)
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("RSA private key: {}", e)))?;
    let plaintext = Zeroizing::new(
        private
            .decrypt(oaep(cipher_type), data)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?,
    );
    Ok(plaintext.to_vec())
}
