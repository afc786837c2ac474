//! Error types for sealup core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid bucket name: {0}")]
    InvalidBucketName(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Invalid part number: {0} (must be between 1 and 10000)")]
    InvalidPartNumber(u64),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid encryption key: {0}")]
    InvalidEncryptionKey(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
