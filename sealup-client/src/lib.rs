//! sealup upload engine
//!
//! Drives S3-style multipart uploads with customer-provided encryption keys
//! against any [`sealup_core::StorageClient`]. Every unrecoverable failure
//! aborts the backend upload before it is surfaced, so no orphaned parts are
//! left behind.

pub mod client;
pub mod error;
pub mod plan;
pub mod retry;
pub mod session;
pub mod uploader;

pub use client::Client;
pub use error::{Cleanup, UploadError};
pub use plan::{PartPlan, PartSpan};
pub use session::{SessionState, UploadSession};
pub use uploader::PartUploader;

pub type Result<T> = std::result::Result<T, UploadError>;
