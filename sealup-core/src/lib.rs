//! Core data models and types for sealup

pub mod backend;
pub mod config;
pub mod error;
pub mod keys;
pub mod timing;
pub mod types;

pub use backend::*;
pub use config::*;
pub use error::*;
pub use keys::*;
pub use types::*;

/// Result type alias for sealup core operations
pub type Result<T> = std::result::Result<T, CoreError>;
