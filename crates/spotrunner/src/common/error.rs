use thiserror::Error;

use crate::common::error::SpotError::GenericError;

#[derive(Debug, Error)]
pub enum SpotError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for SpotError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<rusqlite::Error> for SpotError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StoreError(e.to_string())
    }
}

impl From<anyhow::Error> for SpotError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<toml::de::Error> for SpotError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<tempfile::PersistError> for SpotError {
    fn from(error: tempfile::PersistError) -> Self {
        Self::IoError(error.error)
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}

impl From<String> for SpotError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
