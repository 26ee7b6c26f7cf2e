use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Image reference of a profile whose first image has not been built yet.
pub const IMAGE_NOT_BUILT: &str = "PENDING_BUILD";

pub const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Error, PartialEq)]
pub enum ProfileError {
    #[error("Invalid profile document: {0}")]
    InvalidDocument(String),
    #[error("Profile `{0}` has no instance types")]
    NoInstanceTypes(String),
    #[error("Profile `{0}` has an empty image reference")]
    EmptyImage(String),
    #[error("Profile `{0}` must have a positive disk size")]
    InvalidDiskSize(String),
    #[error("Profile `{0}` must have a positive timeout")]
    InvalidTimeout(String),
    #[error("Invalid profile name `{0}`")]
    InvalidName(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    X64,
    Arm64,
}

impl Architecture {
    /// Architecture name used in runner release archives.
    pub fn runner_name(&self) -> &'static str {
        match self {
            Architecture::X64 => "x64",
            Architecture::Arm64 => "arm64",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SpotPolicy {
    /// Spot capacity only, jobs fail when there is none.
    #[serde(alias = "preemptibleOnly")]
    SpotOnly,
    /// Spot capacity with an on-demand fallback.
    #[serde(alias = "preemptiblePreferred")]
    SpotPreferred,
    OnDemandOnly,
}

impl Display for SpotPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SpotPolicy::SpotOnly => "spotOnly",
            SpotPolicy::SpotPreferred => "spotPreferred",
            SpotPolicy::OnDemandOnly => "onDemandOnly",
        })
    }
}

fn default_disk_size() -> u32 {
    30
}

fn default_timeout() -> u32 {
    60
}

fn default_policy() -> SpotPolicy {
    SpotPolicy::SpotPreferred
}

fn default_architecture() -> Architecture {
    Architecture::X64
}

/// Machine profile, stored as a JSON document keyed by its name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineProfile {
    pub name: String,
    #[serde(default = "default_architecture")]
    pub architecture: Architecture,
    pub instance_types: Vec<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default = "default_disk_size")]
    pub disk_size_gb: u32,
    #[serde(default = "default_policy")]
    pub spot_policy: SpotPolicy,
    #[serde(default = "default_timeout")]
    pub timeout_minutes: u32,
    /// Additional labels of the registered runner.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Routing labels are lowercased before lookup, so names with uppercase letters could never
/// be routed to.
pub fn is_valid_profile_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')
            })
        && !name.starts_with('.')
}

impl MachineProfile {
    /// Parses and validates a profile document.
    ///
    /// Documents without a name take the name they are stored under.
    pub fn from_document(name: &str, mut document: serde_json::Value) -> Result<Self, ProfileError> {
        if let Some(object) = document.as_object_mut() {
            object
                .entry("name")
                .or_insert_with(|| serde_json::Value::String(name.to_string()));
        }
        let profile: MachineProfile = serde_json::from_value(document)
            .map_err(|e| ProfileError::InvalidDocument(format!("{name}: {e}")))?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if !is_valid_profile_name(&self.name) {
            return Err(ProfileError::InvalidName(self.name.clone()));
        }
        if self.instance_types.is_empty()
            || self.instance_types.iter().any(|t| t.trim().is_empty())
        {
            return Err(ProfileError::NoInstanceTypes(self.name.clone()));
        }
        if let Some(image) = &self.image_id {
            if image.trim().is_empty() {
                return Err(ProfileError::EmptyImage(self.name.clone()));
            }
        }
        if self.disk_size_gb == 0 {
            return Err(ProfileError::InvalidDiskSize(self.name.clone()));
        }
        if self.timeout_minutes == 0 {
            return Err(ProfileError::InvalidTimeout(self.name.clone()));
        }
        Ok(())
    }

    /// Image that workers of this profile can boot from, if it was built already.
    pub fn usable_image(&self) -> Option<&str> {
        self.image_id
            .as_deref()
            .filter(|image| !image.is_empty() && *image != IMAGE_NOT_BUILT)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.timeout_minutes) * 60)
    }
}
