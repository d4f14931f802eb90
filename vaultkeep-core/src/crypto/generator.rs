//! Raw cryptographic primitives behind a trait.
//!
//! Higher level derivation code (server KDF, the local master key pipeline,
//! the store key) only talks to [`CryptoGenerator`], so tests can record
//! which primitive was invoked with which cost parameters.

use crate::crypto::{CryptoError, Result};
use argon2::{Algorithm, Argon2, Block, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::ops::Range;

type HmacSha256 = Hmac<Sha256>;

/// Argon2 variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Mode {
    Argon2d,
    Argon2i,
    Argon2id,
}

impl From<Argon2Mode> for Algorithm {
    fn from(mode: Argon2Mode) -> Self {
        match mode {
            Argon2Mode::Argon2d => Algorithm::Argon2d,
            Argon2Mode::Argon2i => Algorithm::Argon2i,
            Argon2Mode::Argon2id => Algorithm::Argon2id,
        }
    }
}

/// Source of hashes, key derivation functions and randomness.
pub trait CryptoGenerator: Send + Sync {
    /// HKDF-SHA256 extract + expand.
    fn hkdf(&self, seed: &[u8], salt: Option<&[u8]>, info: Option<&[u8]>, length: usize) -> Result<Vec<u8>>;

    /// HKDF-SHA256 expand only, treating `prk` as an already extracted key.
    fn hkdf_expand(&self, prk: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>>;

    /// PBKDF2-HMAC-SHA256.
    fn pbkdf2(&self, seed: &[u8], salt: &[u8], iterations: u32, length: usize) -> Result<Vec<u8>>;

    /// Argon2 with a 32 byte output.
    fn argon2(
        &self,
        mode: Argon2Mode,
        seed: &[u8],
        salt: &[u8],
        iterations: u32,
        memory_kb: u32,
        parallelism: u32,
    ) -> Result<Vec<u8>>;

    /// Cryptographically secure random bytes.
    fn seed(&self, length: usize) -> Vec<u8>;

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>>;

    fn hash_sha1(&self, data: &[u8]) -> Vec<u8>;

    fn hash_sha256(&self, data: &[u8]) -> Vec<u8>;

    fn uuid(&self) -> String;

    fn random(&self, range: Range<u32>) -> u32;
}

/// Output length of every Argon2 derivation.
pub const ARGON2_OUTPUT_LEN: usize = 32;

/// [`CryptoGenerator`] backed by the RustCrypto crates and the OS RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCryptoGenerator;

impl CryptoGenerator for DefaultCryptoGenerator {
    fn hkdf(&self, seed: &[u8], salt: Option<&[u8]>, info: Option<&[u8]>, length: usize) -> Result<Vec<u8>> {
        let hkdf = Hkdf::<Sha256>::new(salt, seed);
        let mut out = vec![0u8; length];
        hkdf.expand(info.unwrap_or_default(), &mut out)
            .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;
        Ok(out)
    }

    fn hkdf_expand(&self, prk: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>> {
        let hkdf = Hkdf::<Sha256>::from_prk(prk)
            .map_err(|e| CryptoError::KdfFailed(format!("Invalid HKDF key: {}", e)))?;
        let mut out = vec![0u8; length];
        hkdf.expand(info, &mut out)
            .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;
        Ok(out)
    }

    fn pbkdf2(&self, seed: &[u8], salt: &[u8], iterations: u32, length: usize) -> Result<Vec<u8>> {
        if iterations < 1 {
            return Err(CryptoError::InvalidKdfParams(
                "PBKDF2 needs at least one iteration".to_string(),
            ));
        }
        let mut out = vec![0u8; length];
        pbkdf2::pbkdf2::<HmacSha256>(seed, salt, iterations, &mut out)
            .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;
        Ok(out)
    }

    fn argon2(
        &self,
        mode: Argon2Mode,
        seed: &[u8],
        salt: &[u8],
        iterations: u32,
        memory_kb: u32,
        parallelism: u32,
    ) -> Result<Vec<u8>> {
        let params = Params::new(memory_kb, iterations, parallelism, Some(ARGON2_OUTPUT_LEN))
            .map_err(|e| CryptoError::InvalidKdfParams(format!("Argon2: {}", e)))?;
        let block_count = params.block_count();
        let argon2 = Argon2::new(mode.into(), Version::V0x13, params);

        // The working memory is reserved up front so that a cost the device
        // can not afford becomes an error instead of an allocation abort.
        let mut blocks: Vec<Block> = Vec::new();
        blocks
            .try_reserve_exact(block_count)
            .map_err(|_| CryptoError::OutOfMemoryKdf {
                memory_kb: u64::from(memory_kb),
            })?;
        blocks.resize(block_count, Block::default());

        let mut out = vec![0u8; ARGON2_OUTPUT_LEN];
        argon2
            .hash_password_into_with_memory(seed, salt, &mut out, &mut blocks)
            .map_err(|e| CryptoError::KdfFailed(format!("Argon2 hashing failed: {}", e)))?;
        Ok(out)
    }

    fn seed(&self, length: usize) -> Vec<u8> {
        let mut out = vec![0u8; length];
        rand::rngs::OsRng.fill_bytes(&mut out);
        out
    }

    fn hmac_sha256(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| CryptoError::InvalidKeyMaterial(format!("HMAC key: {}", e)))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn hash_sha1(&self, data: &[u8]) -> Vec<u8> {
        Sha1::digest(data).to_vec()
    }

    fn hash_sha256(&self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    fn uuid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn random(&self, range: Range<u32>) -> u32 {
        rand::thread_rng().gen_range(range)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Pbkdf2Call {
        pub iterations: u32,
        pub length: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Argon2Call {
        pub mode: Argon2Mode,
        pub iterations: u32,
        pub memory_kb: u32,
        pub parallelism: u32,
    }

    /// Generator that records KDF invocations and returns fixed bytes.
    #[derive(Default)]
    pub struct RecordingCryptoGenerator {
        pub pbkdf2_calls: Mutex<Vec<Pbkdf2Call>>,
        pub argon2_calls: Mutex<Vec<Argon2Call>>,
    }

    impl CryptoGenerator for RecordingCryptoGenerator {
        fn hkdf(&self, _: &[u8], _: Option<&[u8]>, _: Option<&[u8]>, length: usize) -> Result<Vec<u8>> {
            Ok(vec![0u8; length])
        }

        fn hkdf_expand(&self, _: &[u8], _: &[u8], length: usize) -> Result<Vec<u8>> {
            Ok(vec![0u8; length])
        }

        fn pbkdf2(&self, _: &[u8], _: &[u8], iterations: u32, length: usize) -> Result<Vec<u8>> {
            self.pbkdf2_calls.lock().unwrap().push(Pbkdf2Call { iterations, length });
            Ok(vec![0x11; length])
        }

        fn argon2(
            &self,
            mode: Argon2Mode,
            _: &[u8],
            _: &[u8],
            iterations: u32,
            memory_kb: u32,
            parallelism: u32,
        ) -> Result<Vec<u8>> {
            self.argon2_calls.lock().unwrap().push(Argon2Call {
                mode,
                iterations,
                memory_kb,
                parallelism,
            });
            Ok(vec![0x22; ARGON2_OUTPUT_LEN])
        }

        fn seed(&self, length: usize) -> Vec<u8> {
            vec![0x33; length]
        }

        fn hmac_sha256(&self, _: &[u8], _: &[u8]) -> Result<Vec<u8>> {
            Ok(vec![0u8; 32])
        }

        fn hash_sha1(&self, _: &[u8]) -> Vec<u8> {
            vec![0u8; 20]
        }

        fn hash_sha256(&self, _: &[u8]) -> Vec<u8> {
            vec![0u8; 32]
        }

        fn uuid(&self) -> String {
            "00000000-0000-0000-0000-000000000000".to_string()
        }

        fn random(&self, range: Range<u32>) -> u32 {
            range.start
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pbkdf2_rfc7914_vector() {
        // RFC 7914 section 11, PBKDF2-HMAC-SHA256 with c = 1
        let out = DefaultCryptoGenerator
            .pbkdf2(b"passwd", b"salt", 1, 64)
            .unwrap();
        assert_eq!(
            &out[..8],
            &[0x55, 0xac, 0x04, 0x6e, 0x56, 0xe3, 0x08, 0x9f]
        );
    }

    #[test]
    fn test_pbkdf2_rejects_zero_iterations() {
        let result = DefaultCryptoGenerator.pbkdf2(b"pw", b"salt", 0, 32);
        assert!(matches!(result, Err(CryptoError::InvalidKdfParams(_))));
    }

    #[test]
    fn test_hkdf_rfc5869_case1() {
        let ikm = [0x0bu8; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();
        let okm = DefaultCryptoGenerator
            .hkdf(&ikm, Some(&salt), Some(&info), 42)
            .unwrap();
        assert_eq!(&okm[..6], &[0x3c, 0xb2, 0x5f, 0x25, 0xfa, 0xac]);
    }

    #[test]
    fn test_hkdf_expand_domain_separation() {
        let prk = [7u8; 32];
        let enc = DefaultCryptoGenerator.hkdf_expand(&prk, b"enc", 32).unwrap();
        let mac = DefaultCryptoGenerator.hkdf_expand(&prk, b"mac", 32).unwrap();
        assert_ne!(enc, mac);
    }

    #[test]
    fn test_argon2_small_params() {
        let a = DefaultCryptoGenerator
            .argon2(Argon2Mode::Argon2id, b"password", b"saltsaltsaltsalt", 1, 64, 1)
            .unwrap();
        let b = DefaultCryptoGenerator
            .argon2(Argon2Mode::Argon2id, b"password", b"saltsaltsaltsalt", 1, 64, 1)
            .unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(a, b);
    }

    #[test]
    fn test_argon2_invalid_params() {
        let result = DefaultCryptoGenerator.argon2(Argon2Mode::Argon2id, b"pw", b"saltsalt", 0, 64, 1);
        assert!(matches!(result, Err(CryptoError::InvalidKdfParams(_))));
    }

    #[test]
    fn test_argon2_unaffordable_memory_is_typed() {
        let result =
            DefaultCryptoGenerator.argon2(Argon2Mode::Argon2id, b"pw", b"saltsaltsalt", 1, u32::MAX, 1);
        match result {
            Err(CryptoError::OutOfMemoryKdf { memory_kb }) => {
                assert_eq!(memory_kb, u64::from(u32::MAX))
            }
            other => panic!("expected OutOfMemoryKdf, got {:?}", other.map(|k| k.len())),
        }
    }

    #[test]
    fn test_hashes() {
        assert_eq!(DefaultCryptoGenerator.hash_sha1(b"abc").len(), 20);
        let sha = DefaultCryptoGenerator.hash_sha256(b"abc");
        assert_eq!(&sha[..4], &[0xba, 0x78, 0x16, 0xbf]);
    }

    #[test]
    fn test_seed_is_random() {
        let a = DefaultCryptoGenerator.seed(32);
        let b = DefaultCryptoGenerator.seed(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
