//! Webhook deliveries of the upstream service.
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const DELIVERY_HEADER: &str = "x-github-delivery";

pub const WORKFLOW_JOB_EVENT: &str = "workflow_job";
pub const QUEUED_ACTION: &str = "queued";

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error, PartialEq)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,
    #[error("invalid signature format")]
    InvalidFormat,
    #[error("invalid signature")]
    Mismatch,
}

fn mac(secret: &[u8]) -> Result<HmacSha256, SignatureError> {
    HmacSha256::new_from_slice(secret).map_err(|_| SignatureError::InvalidFormat)
}

/// Computes the signature header value of `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    match mac(secret) {
        Ok(mut mac) => {
            mac.update(body);
            format!("{SIGNATURE_PREFIX}{}", hex::encode(mac.finalize().into_bytes()))
        }
        // HMAC accepts keys of any length
        Err(_) => String::new(),
    }
}

/// Verifies the `sha256=<hex>` signature of a delivery. The comparison runs in constant time.
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    header: Option<&str>,
) -> Result<(), SignatureError> {
    let header = header.ok_or(SignatureError::Missing)?;
    let encoded = header
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(SignatureError::InvalidFormat)?;
    let expected = hex::decode(encoded).map_err(|_| SignatureError::InvalidFormat)?;

    let mut mac = mac(secret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJobEvent {
    pub action: String,
    pub workflow_job: WorkflowJob,
    pub repository: Repository,
    pub installation: Option<Installation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    pub run_id: Option<u64>,
    pub name: Option<String>,
    pub workflow_name: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Installation {
    pub id: u64,
}

impl WorkflowJobEvent {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn job_id(&self) -> String {
        self.workflow_job.id.to_string()
    }

    pub fn workflow_name(&self) -> String {
        self.workflow_job
            .workflow_name
            .clone()
            .or_else(|| self.workflow_job.name.clone())
            .unwrap_or_default()
    }
}
