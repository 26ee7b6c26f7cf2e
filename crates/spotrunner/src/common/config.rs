//! Configuration of the whole system.
//!
//! Configuration is read from a TOML file. Every policy value has a default, so an empty file
//! (or no file at all) yields a usable configuration for local experiments. Secrets can be
//! passed through the environment instead of the file.
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::Map;
use crate::common::timeutils::{deserialize_human_duration, deserialize_human_duration_opt};
use crate::router::profile::Architecture;

pub const CONFIG_ENV: &str = "SPOTRUNNER_CONFIG";
pub const WEBHOOK_SECRET_ENV: &str = "SPOTRUNNER_WEBHOOK_SECRET";
pub const PRIVATE_KEY_ENV: &str = "SPOTRUNNER_GITHUB_PRIVATE_KEY";

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields, default)]
pub struct SpotrunnerConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub routing: RoutingConfig,
    pub policy: PolicyConfig,
    pub github: GithubConfig,
    pub compute: ComputeConfig,
    pub runner: RunnerConfig,
    pub images: ImagesConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    /// SQLite database with job and image records. Records are kept in memory when unset.
    pub database: Option<PathBuf>,
    /// Directory with one JSON document per machine profile.
    pub profiles_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: None,
            profiles_dir: PathBuf::from("profiles"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct RoutingConfig {
    /// Prefix of job labels that are routed to machine profiles.
    pub namespace: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            namespace: crate::DEFAULT_NAMESPACE.to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct PolicyConfig {
    /// Jobs that did not reach `running` within this time are timed out.
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub provisioning_deadline: Duration,
    /// Running jobs are stopped after this time, unless their profile says otherwise.
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub job_timeout: Duration,
    /// Image records stay in `building` at most this long before they are reconciled.
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub image_staleness: Duration,
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub reconcile_interval: Duration,
    /// Job records are purged this long after their creation.
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub retention: Duration,
    /// How long the upstream connectivity check is memoized. Forever when unset.
    #[serde(deserialize_with = "deserialize_human_duration_opt")]
    pub connectivity_ttl: Option<Duration>,
    /// How long the status endpoint waits before it reconciles images again. Once per process
    /// when unset.
    #[serde(deserialize_with = "deserialize_human_duration_opt")]
    pub image_reconcile_ttl: Option<Duration>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            provisioning_deadline: Duration::from_secs(10 * 60),
            job_timeout: Duration::from_secs(60 * 60),
            image_staleness: Duration::from_secs(30 * 60),
            reconcile_interval: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            connectivity_ttl: None,
            image_reconcile_ttl: None,
        }
    }
}

#[derive(Deserialize, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct GithubConfig {
    pub app_id: Option<String>,
    /// PEM encoded private key of the app.
    pub private_key: Option<String>,
    pub private_key_file: Option<PathBuf>,
    pub webhook_secret: Option<String>,
    pub api_url: String,
    pub runner_group_id: u64,
    /// Cached installation tokens are replaced this long before they expire.
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub token_refresh_margin: Duration,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            app_id: None,
            private_key: None,
            private_key_file: None,
            webhook_secret: None,
            api_url: "https://api.github.com".to_string(),
            runner_group_id: 1,
            token_refresh_margin: Duration::from_secs(5 * 60),
        }
    }
}

impl Debug for GithubConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let redacted = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("GithubConfig")
            .field("app_id", &self.app_id)
            .field("private_key", &redacted(&self.private_key))
            .field("private_key_file", &self.private_key_file)
            .field("webhook_secret", &redacted(&self.webhook_secret))
            .field("api_url", &self.api_url)
            .field("runner_group_id", &self.runner_group_id)
            .field("token_refresh_margin", &self.token_refresh_margin)
            .finish()
    }
}

impl GithubConfig {
    /// Returns the private key of the app, read from the key file if it is not set inline.
    pub fn load_private_key(&self) -> crate::Result<Option<String>> {
        if let Some(key) = &self.private_key {
            return Ok(Some(key.clone()));
        }
        match &self.private_key_file {
            Some(path) => Ok(Some(std::fs::read_to_string(path).map_err(|e| {
                crate::Error::ConfigError(format!(
                    "Cannot read private key from {}: {e}",
                    path.display()
                ))
            })?)),
            None => Ok(None),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct ComputeConfig {
    pub region: Option<String>,
    /// Subnets the fleet may place workers into.
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub instance_profile: Option<String>,
    pub key_name: Option<String>,
    /// Root device of the worker images, resized to the disk size of the profile.
    pub root_device_name: String,
    /// Command used to invoke the AWS command line interface.
    pub aws_cli: Vec<String>,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            region: None,
            subnets: vec![],
            security_groups: vec![],
            instance_profile: None,
            key_name: None,
            root_device_name: "/dev/sda1".to_string(),
            aws_cli: vec!["aws".to_string()],
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct RunnerConfig {
    pub version: String,
    /// `{version}` and `{arch}` are replaced by the runner version and architecture.
    pub download_url: String,
    /// Pinned SHA-256 of the runner archive per architecture.
    pub checksums: Map<Architecture, String>,
    pub install_dir: PathBuf,
    pub agent_path: String,
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub preemption_poll_interval: Duration,
    #[serde(deserialize_with = "deserialize_human_duration")]
    pub preemption_grace_period: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            version: "2.321.0".to_string(),
            download_url: "https://github.com/actions/runner/releases/download/v{version}/actions-runner-linux-{arch}-{version}.tar.gz".to_string(),
            checksums: Map::new(),
            install_dir: PathBuf::from("/opt/actions-runner"),
            agent_path: spotrunner_boot::payload::DEFAULT_AGENT_PATH.to_string(),
            preemption_poll_interval: Duration::from_secs(5),
            preemption_grace_period: Duration::from_secs(90),
        }
    }
}

impl RunnerConfig {
    pub fn download_url_for(&self, arch: Architecture) -> String {
        self.download_url
            .replace("{version}", &self.version)
            .replace("{arch}", arch.runner_name())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields, default)]
pub struct ImagesConfig {
    /// Build pipelines are named `<pipeline_prefix>-<profile>`.
    pub pipeline_prefix: String,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            pipeline_prefix: "spotrunner".to_string(),
        }
    }
}

impl SpotrunnerConfig {
    pub fn parse(text: &str) -> crate::Result<Self> {
        let config: SpotrunnerConfig = toml::from_str(text)?;
        Ok(config)
    }

    /// Loads the configuration file (if any) and applies secrets from the environment.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    crate::Error::ConfigError(format!(
                        "Cannot read configuration file {}: {e}",
                        path.display()
                    ))
                })?;
                Self::parse(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, get_env: F) {
        if let Some(secret) = get_env(WEBHOOK_SECRET_ENV).filter(|s| !s.is_empty()) {
            self.github.webhook_secret = Some(secret);
        }
        if let Some(key) = get_env(PRIVATE_KEY_ENV).filter(|s| !s.is_empty()) {
            self.github.private_key = Some(key);
        }
    }
}
