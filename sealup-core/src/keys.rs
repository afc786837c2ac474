//! Customer-provided encryption keys (SSE-C)
//!
//! Provides key generation, fingerprinting and the header encoding the
//! storage API expects. A key is generated once per upload and only ever
//! lives in memory.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::timing::constant_time_str_compare;
use crate::{CoreError, Result};

/// Raw key length for AES-256
pub const KEY_LEN: usize = 32;

pub const HEADER_SSE_C_ALGORITHM: &str = "x-amz-server-side-encryption-customer-algorithm";
pub const HEADER_SSE_C_KEY: &str = "x-amz-server-side-encryption-customer-key";
pub const HEADER_SSE_C_KEY_MD5: &str = "x-amz-server-side-encryption-customer-key-MD5";

/// Server-side encryption algorithm for customer-provided keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SseAlgorithm {
    #[serde(rename = "AES256")]
    Aes256,
}

impl SseAlgorithm {
    /// Parse from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AES256" => Some(Self::Aes256),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes256 => "AES256",
        }
    }
}

impl fmt::Display for SseAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base64 MD5 digest of the raw key bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyFingerprint(String);

impl KeyFingerprint {
    /// Compute the fingerprint of raw key bytes
    pub fn of(key: &[u8]) -> Self {
        KeyFingerprint(BASE64.encode(Md5::digest(key)))
    }

    pub fn from_string(s: String) -> Self {
        KeyFingerprint(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time equality against a fingerprint received over the wire
    pub fn matches(&self, other: &str) -> bool {
        constant_time_str_compare(&self.0, other)
    }
}

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 256-bit customer key plus its fingerprint
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: [u8; KEY_LEN],
    fingerprint: KeyFingerprint,
}

impl EncryptionKey {
    /// Wrap existing key bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let fingerprint = KeyFingerprint::of(&bytes);
        EncryptionKey { bytes, fingerprint }
    }

    /// Import a base64-encoded key, as accepted on the wire
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| CoreError::InvalidEncryptionKey(format!("invalid base64: {}", e)))?;

        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|raw: Vec<u8>| {
            CoreError::InvalidEncryptionKey(format!(
                "expected {} key bytes, got {}",
                KEY_LEN,
                raw.len()
            ))
        })?;

        Ok(Self::from_bytes(bytes))
    }

    /// Raw key bytes (sensitive)
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Base64 form of the key (sensitive)
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }

    pub fn fingerprint(&self) -> &KeyFingerprint {
        &self.fingerprint
    }

    pub fn algorithm(&self) -> SseAlgorithm {
        SseAlgorithm::Aes256
    }

    /// Header set presented on initiate, every part upload and completion
    pub fn headers(&self) -> SseCustomerHeaders {
        SseCustomerHeaders {
            algorithm: self.algorithm(),
            key: self.to_base64(),
            key_md5: self.fingerprint.as_str().to_string(),
        }
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        crate::timing::constant_time_sig_compare(&self.bytes, &other.bytes)
    }
}

impl Eq for EncryptionKey {}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// SSE-C values as carried on a request
#[derive(Clone, PartialEq, Eq)]
pub struct SseCustomerHeaders {
    pub algorithm: SseAlgorithm,
    /// Base64 key
    pub key: String,
    /// Base64 MD5 of the raw key
    pub key_md5: String,
}

impl SseCustomerHeaders {
    /// Build from raw header values, validating the algorithm name
    pub fn from_parts(algorithm: &str, key: &str, key_md5: &str) -> Result<Self> {
        let algorithm = SseAlgorithm::parse(algorithm).ok_or_else(|| {
            CoreError::InvalidEncryptionKey(format!("unsupported algorithm '{}'", algorithm))
        })?;

        Ok(SseCustomerHeaders {
            algorithm,
            key: key.to_string(),
            key_md5: key_md5.to_string(),
        })
    }

    /// Decode the key and check it against the declared fingerprint
    pub fn decode(&self) -> Result<EncryptionKey> {
        let key = EncryptionKey::from_base64(&self.key)?;
        if !key.fingerprint().matches(&self.key_md5) {
            return Err(CoreError::InvalidEncryptionKey(
                "key MD5 does not match the provided key".to_string(),
            ));
        }
        Ok(key)
    }

    pub fn header_pairs(&self) -> [(&'static str, String); 3] {
        [
            (HEADER_SSE_C_ALGORITHM, self.algorithm.as_str().to_string()),
            (HEADER_SSE_C_KEY, self.key.clone()),
            (HEADER_SSE_C_KEY_MD5, self.key_md5.clone()),
        ]
    }
}

impl fmt::Debug for SseCustomerHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseCustomerHeaders")
            .field("algorithm", &self.algorithm)
            .field("key_md5", &self.key_md5)
            .finish_non_exhaustive()
    }
}

/// Source of fresh per-upload keys
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyProvider;

impl KeyProvider {
    pub fn new() -> Self {
        KeyProvider
    }

    /// Generate a fresh key from the operating system CSPRNG
    pub fn generate(&self) -> Result<EncryptionKey> {
        Self::generate_with(&mut OsRng)
    }

    /// Generate a key from the given cryptographically secure source
    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Result<EncryptionKey> {
        let mut bytes = [0u8; KEY_LEN];
        rng.try_fill_bytes(&mut bytes)
            .map_err(|e| CoreError::KeyGeneration(e.to_string()))?;
        Ok(EncryptionKey::from_bytes(bytes))
    }
}
