//! Compute capacity provider. Workers are EC2 instances that are launched either through an
//! instant spot fleet or as plain on-demand instances.
pub mod ec2;
pub mod tags;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::Map;

pub type ComputeResult<T> = anyhow::Result<T>;

/// State reason code of instances reclaimed by a spot interruption.
pub const SPOT_INTERRUPTION_REASON: &str = "Server.SpotInstanceTermination";

/// Everything needed to launch one worker, independent of the capacity market.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Used to name temporary resources of the launch.
    pub job_id: String,
    pub image_id: String,
    pub disk_size_gb: u32,
    /// Boot script of the worker.
    pub user_data: String,
    /// Applied to the instance and its volumes when they are created.
    pub tags: Vec<(String, String)>,
}

/// Attribute based selection of instance types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceRequirements {
    pub vcpu: Option<u32>,
    pub memory_gib: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetRequest {
    pub spec: LaunchSpec,
    /// Candidate shapes, combined with every subnet.
    pub instance_types: Vec<String>,
    /// When set, replaces `instance_types`.
    pub requirements: Option<InstanceRequirements>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnDemandRequest {
    pub spec: LaunchSpec,
    pub instance_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedInstance {
    pub instance_id: String,
    pub instance_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Terminated,
    /// The instance does not exist anymore.
    AlreadyGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "pending" => InstanceState::Pending,
            "running" => InstanceState::Running,
            "shutting-down" => InstanceState::ShuttingDown,
            "terminated" => InstanceState::Terminated,
            "stopping" => InstanceState::Stopping,
            "stopped" => InstanceState::Stopped,
            _ => return None,
        })
    }

    /// The instance is gone or about to be gone.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::ShuttingDown | InstanceState::Terminated)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedInstance {
    pub instance_id: String,
    pub state: InstanceState,
    pub state_reason: Option<String>,
    pub launch_time: DateTime<Utc>,
    pub tags: Map<String, String>,
}

impl TaggedInstance {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(|value| value.as_str())
    }

    pub fn was_interrupted(&self) -> bool {
        self.state_reason.as_deref() == Some(SPOT_INTERRUPTION_REASON)
    }
}

/// Handler that can talk to the compute provider.
pub trait ComputeHandler: Send + Sync {
    /// Requests one spot instance through an instant fleet.
    ///
    /// Returns `None` if the fleet was created, but no capacity was available.
    fn create_fleet<'a>(
        &'a self,
        request: &'a FleetRequest,
    ) -> BoxFuture<'a, ComputeResult<Option<LaunchedInstance>>>;

    /// Launches one on-demand instance.
    fn run_instance<'a>(
        &'a self,
        request: &'a OnDemandRequest,
    ) -> BoxFuture<'a, ComputeResult<LaunchedInstance>>;

    /// Terminates the instance, if it still exists.
    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BoxFuture<'a, ComputeResult<TerminateOutcome>>;

    /// Lists all instances carrying the job id tag, including recently terminated ones.
    fn list_tagged_instances(&self) -> BoxFuture<'_, ComputeResult<Vec<TaggedInstance>>>;
}

pub type ComputeHandlerRef = Arc<dyn ComputeHandler>;
