//! The upstream work-queue service (GitHub Actions).
pub mod github;
pub mod webhook;

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum UpstreamError {
    #[error("GitHub app credentials are not configured")]
    NotConfigured,
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("GitHub API returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Cannot reach GitHub API: {0}")]
    Transport(String),
    #[error("Invalid response from GitHub API: {0}")]
    InvalidResponse(String),
}

/// Short-lived token of an app installation.
#[derive(Clone)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Debug for InstallationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Request for a single-use runner registration credential.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRequest {
    pub repo_full_name: String,
    pub runner_name: String,
    pub labels: Vec<String>,
}

/// Outcome of the connectivity check, as shown by the status endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Connectivity {
    Connected { app_slug: Option<String> },
    AuthenticationError(String),
    Unreachable(String),
    UnexpectedError(String),
}

impl Connectivity {
    pub fn is_connected(&self) -> bool {
        matches!(self, Connectivity::Connected { .. })
    }
}

/// Client of the upstream service.
pub trait UpstreamClient: Send + Sync {
    /// Exchanges the app credentials for an installation token.
    fn installation_token(
        &self,
        installation_id: u64,
    ) -> BoxFuture<'_, Result<InstallationToken, UpstreamError>>;

    /// Requests a just-in-time runner configuration. The returned string is the encoded
    /// configuration that is passed to the runner.
    fn registration_config<'a>(
        &'a self,
        token: &'a InstallationToken,
        request: &'a RegistrationRequest,
    ) -> BoxFuture<'a, Result<String, UpstreamError>>;

    /// Performs an authenticated handshake with the app identity endpoint.
    fn check_connectivity(&self) -> BoxFuture<'_, Connectivity>;
}

pub type UpstreamClientRef = Arc<dyn UpstreamClient>;
