//! Boot agent for spotrunner workers.
//!
//! A worker machine receives a [`payload::BootPayload`] through its user data. The agent
//! installs the job runner (unless it is baked into the image), starts it with a single-use
//! registration credential, watches for spot interruption notices and for the job timeout,
//! and finally terminates the machine. The machine must never outlive its job, so every exit
//! path of the agent ends with [`agent::self_terminate`].
pub mod agent;
pub mod install;
pub mod metadata;
pub mod payload;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Invalid boot payload: {0}")]
    InvalidPayload(String),
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("Download failed: {0}")]
    DownloadError(#[from] reqwest::Error),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::Error> for BootError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidPayload(e.to_string())
    }
}

impl From<base64::DecodeError> for BootError {
    fn from(e: base64::DecodeError) -> Self {
        Self::InvalidPayload(e.to_string())
    }
}

impl From<String> for BootError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

pub type Result<T> = std::result::Result<T, BootError>;
