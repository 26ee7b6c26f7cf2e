use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

/// Version of the payload format. The agent refuses payloads with a different version.
pub const PAYLOAD_VERSION: u32 = 1;

/// Location of the boot agent binary baked into worker images.
pub const DEFAULT_AGENT_PATH: &str = "/opt/spotrunner/bin/spotrunner-boot";

/// Where the user data script stores the payload before starting the agent.
pub const PAYLOAD_FILE_PATH: &str = "/run/spotrunner/payload";

pub const DEFAULT_METADATA_URL: &str = "http://169.254.169.254";

/// Everything a worker machine needs to run exactly one job.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootPayload {
    pub version: u32,
    pub job_id: String,
    /// Single-use runner registration credential.
    pub jit_config: String,
    /// The job (and the machine) is force-stopped after this many seconds.
    pub timeout_secs: u64,
    pub runner: RunnerInstall,
    pub preemption: PreemptionSettings,
    /// Command that terminates the machine. Instances are launched with
    /// shutdown behavior `terminate`, so a plain shutdown is enough.
    pub shutdown_command: Vec<String>,
}

impl Debug for BootPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootPayload")
            .field("version", &self.version)
            .field("job_id", &self.job_id)
            .field("jit_config", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .field("runner", &self.runner)
            .field("preemption", &self.preemption)
            .field("shutdown_command", &self.shutdown_command)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerInstall {
    pub version: String,
    pub download_url: String,
    /// Hex encoded SHA-256 of the archive behind `download_url`.
    pub sha256: String,
    pub install_dir: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreemptionSettings {
    pub metadata_url: String,
    pub poll_interval_secs: u64,
    /// How long the runner gets to stop gracefully after an interruption notice.
    pub grace_period_secs: u64,
}

impl Default for PreemptionSettings {
    fn default() -> Self {
        Self {
            metadata_url: DEFAULT_METADATA_URL.to_string(),
            poll_interval_secs: 5,
            grace_period_secs: 90,
        }
    }
}

impl PreemptionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

pub fn default_shutdown_command() -> Vec<String> {
    vec!["shutdown".to_string(), "-h".to_string(), "now".to_string()]
}

impl BootPayload {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Serializes the payload into a base64 string that is safe to embed into a shell script.
    pub fn encode(&self) -> crate::Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(json))
    }

    pub fn decode(encoded: &str) -> crate::Result<Self> {
        let json = BASE64.decode(encoded.trim())?;
        let payload: BootPayload = serde_json::from_slice(&json)?;
        if payload.version != PAYLOAD_VERSION {
            return Err(crate::BootError::InvalidPayload(format!(
                "unsupported payload version {}, expected {PAYLOAD_VERSION}",
                payload.version
            )));
        }
        if payload.jit_config.is_empty() {
            return Err(crate::BootError::InvalidPayload(
                "missing registration credential".to_string(),
            ));
        }
        Ok(payload)
    }
}

/// Renders the user data script of a worker machine.
///
/// The script stores the payload in a file readable only by root and hands the file to the
/// boot agent, so the registration credential never appears on a command line. If the agent is
/// missing or returns for any reason, the script shuts the machine down itself.
pub fn render_user_data(payload: &BootPayload, agent_path: &str) -> crate::Result<String> {
    let encoded = payload.encode()?;
    Ok(render_script(agent_path, PAYLOAD_FILE_PATH, &encoded))
}

fn render_script(agent_path: &str, payload_path: &str, encoded_payload: &str) -> String {
    format!(
        r#"#!/bin/bash
# spotrunner worker bootstrap
AGENT="{agent_path}"
PAYLOAD_FILE="{payload_path}"
umask 077
mkdir -p "$(dirname "$PAYLOAD_FILE")"
cat > "$PAYLOAD_FILE" <<'SPOTRUNNER_PAYLOAD'
{encoded_payload}
SPOTRUNNER_PAYLOAD
if [ -x "$AGENT" ]; then
  "$AGENT" --payload-file "$PAYLOAD_FILE"
fi
shutdown -h now
"#
    )
}
