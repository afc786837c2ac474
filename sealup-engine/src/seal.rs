//! AES-256-GCM sealing of part bodies under the customer key

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sealup_core::{BackendError, EncryptionKey};

use crate::Result;

pub const NONCE_LEN: usize = 12;

/// Encrypt `plaintext` with a fresh random nonce
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher = cipher(key)?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| BackendError::internal("failed to encrypt part"))?;

    Ok((nonce, ciphertext))
}

/// Decrypt and authenticate a sealed part
pub fn open(key: &EncryptionKey, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    cipher(key)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| BackendError::internal("failed to decrypt part: authentication failed"))
}

fn cipher(key: &EncryptionKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| BackendError::internal(format!("invalid cipher key: {}", e)))
}
