//! Fake collaborators and fixtures shared by unit tests.
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;

use crate::Map;
use crate::build::{BuildInfo, BuildPipelineHandler, BuildResult};
use crate::common::clock::ManualClock;
use crate::compute::{
    ComputeHandler, ComputeResult, FleetRequest, InstanceState, LaunchedInstance,
    OnDemandRequest, TaggedInstance, TerminateOutcome,
};
use crate::router::profile::{Architecture, MachineProfile, SpotPolicy};
use crate::upstream::{
    Connectivity, InstallationToken, RegistrationRequest, UpstreamClient, UpstreamError,
};

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap()
}

pub fn test_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(start_time()))
}

pub fn test_profile(name: &str) -> MachineProfile {
    MachineProfile {
        name: name.to_string(),
        architecture: Architecture::X64,
        instance_types: vec!["c7i.large".to_string(), "c6i.large".to_string()],
        image_id: Some(format!("ami-{name}")),
        disk_size_gb: 30,
        spot_policy: SpotPolicy::SpotPreferred,
        timeout_minutes: 60,
        labels: vec![],
    }
}

pub fn profile_document(profile: &MachineProfile) -> serde_json::Value {
    serde_json::to_value(profile).unwrap()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

// Compute
#[derive(Clone, Copy, Debug)]
pub enum FleetBehavior {
    Launch,
    NoCapacity,
    Fail,
}

#[derive(Default)]
struct ComputeState {
    fleet_requests: Vec<FleetRequest>,
    on_demand_requests: Vec<OnDemandRequest>,
    terminated: Vec<String>,
    instances: Vec<TaggedInstance>,
    failing_terminations: Vec<String>,
}

pub struct FakeCompute {
    fleet: FleetBehavior,
    spot_instance: LaunchedInstance,
    on_demand_fails: bool,
    state: Mutex<ComputeState>,
}

impl FakeCompute {
    pub fn new(fleet: FleetBehavior) -> Self {
        Self {
            fleet,
            spot_instance: LaunchedInstance {
                instance_id: "i-spot".to_string(),
                instance_type: "c7i.large".to_string(),
            },
            on_demand_fails: false,
            state: Default::default(),
        }
    }

    pub fn with_spot_instance(mut self, instance_id: &str, instance_type: &str) -> Self {
        self.spot_instance = LaunchedInstance {
            instance_id: instance_id.to_string(),
            instance_type: instance_type.to_string(),
        };
        self
    }

    pub fn fail_on_demand(mut self) -> Self {
        self.on_demand_fails = true;
        self
    }

    pub fn add_instance(&self, instance: TaggedInstance) {
        lock(&self.state).instances.push(instance);
    }

    pub fn fail_termination_of(&self, instance_id: &str) {
        lock(&self.state)
            .failing_terminations
            .push(instance_id.to_string());
    }

    pub fn fleet_requests(&self) -> Vec<FleetRequest> {
        lock(&self.state).fleet_requests.clone()
    }

    pub fn on_demand_requests(&self) -> Vec<OnDemandRequest> {
        lock(&self.state).on_demand_requests.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        lock(&self.state).terminated.clone()
    }

    pub fn call_count(&self) -> usize {
        let state = lock(&self.state);
        state.fleet_requests.len() + state.on_demand_requests.len() + state.terminated.len()
    }
}

pub fn tagged_instance(
    instance_id: &str,
    job_id: &str,
    state: InstanceState,
    launch_time: DateTime<Utc>,
) -> TaggedInstance {
    let mut tags = Map::new();
    tags.insert(
        crate::compute::tags::TAG_JOB_ID.to_string(),
        job_id.to_string(),
    );
    TaggedInstance {
        instance_id: instance_id.to_string(),
        state,
        state_reason: None,
        launch_time,
        tags,
    }
}

impl ComputeHandler for FakeCompute {
    fn create_fleet<'a>(
        &'a self,
        request: &'a FleetRequest,
    ) -> BoxFuture<'a, ComputeResult<Option<LaunchedInstance>>> {
        Box::pin(async move {
            lock(&self.state).fleet_requests.push(request.clone());
            match self.fleet {
                FleetBehavior::Launch => Ok(Some(self.spot_instance.clone())),
                FleetBehavior::NoCapacity => Ok(None),
                FleetBehavior::Fail => Err(anyhow::anyhow!("InsufficientInstanceCapacity")),
            }
        })
    }

    fn run_instance<'a>(
        &'a self,
        request: &'a OnDemandRequest,
    ) -> BoxFuture<'a, ComputeResult<LaunchedInstance>> {
        Box::pin(async move {
            lock(&self.state).on_demand_requests.push(request.clone());
            if self.on_demand_fails {
                return Err(anyhow::anyhow!("InstanceLimitExceeded"));
            }
            Ok(LaunchedInstance {
                instance_id: "i-ondemand".to_string(),
                instance_type: request.instance_type.clone(),
            })
        })
    }

    fn terminate_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> BoxFuture<'a, ComputeResult<TerminateOutcome>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.terminated.push(instance_id.to_string());
            if state.failing_terminations.iter().any(|id| id == instance_id) {
                return Err(anyhow::anyhow!("UnauthorizedOperation"));
            }
            match state
                .instances
                .iter_mut()
                .find(|instance| instance.instance_id == instance_id)
            {
                Some(instance) if !instance.state.is_terminal() => {
                    instance.state = InstanceState::ShuttingDown;
                    Ok(TerminateOutcome::Terminated)
                }
                _ => Ok(TerminateOutcome::AlreadyGone),
            }
        })
    }

    fn list_tagged_instances(&self) -> BoxFuture<'_, ComputeResult<Vec<TaggedInstance>>> {
        Box::pin(async move { Ok(lock(&self.state).instances.clone()) })
    }
}

// Upstream
#[derive(Default)]
struct UpstreamState {
    token_requests: Vec<u64>,
    registrations: Vec<RegistrationRequest>,
    connectivity_checks: usize,
}

pub struct FakeUpstream {
    token_error: Option<UpstreamError>,
    registration_error: Option<UpstreamError>,
    connectivity: Connectivity,
    state: Mutex<UpstreamState>,
}

impl Default for FakeUpstream {
    fn default() -> Self {
        Self {
            token_error: None,
            registration_error: None,
            connectivity: Connectivity::Connected {
                app_slug: Some("spot-app".to_string()),
            },
            state: Default::default(),
        }
    }
}

impl FakeUpstream {
    pub fn failing_registration(error: UpstreamError) -> Self {
        Self {
            registration_error: Some(error),
            ..Default::default()
        }
    }

    pub fn failing_token(error: UpstreamError) -> Self {
        Self {
            token_error: Some(error),
            ..Default::default()
        }
    }

    pub fn with_connectivity(connectivity: Connectivity) -> Self {
        Self {
            connectivity,
            ..Default::default()
        }
    }

    pub fn token_requests(&self) -> Vec<u64> {
        lock(&self.state).token_requests.clone()
    }

    pub fn registrations(&self) -> Vec<RegistrationRequest> {
        lock(&self.state).registrations.clone()
    }

    pub fn connectivity_checks(&self) -> usize {
        lock(&self.state).connectivity_checks
    }
}

impl UpstreamClient for FakeUpstream {
    fn installation_token(
        &self,
        installation_id: u64,
    ) -> BoxFuture<'_, Result<InstallationToken, UpstreamError>> {
        Box::pin(async move {
            lock(&self.state).token_requests.push(installation_id);
            if let Some(error) = &self.token_error {
                return Err(error.clone());
            }
            Ok(InstallationToken {
                token: format!("ghs_{installation_id}"),
                expires_at: start_time() + chrono::Duration::hours(1),
            })
        })
    }

    fn registration_config<'a>(
        &'a self,
        _token: &'a InstallationToken,
        request: &'a RegistrationRequest,
    ) -> BoxFuture<'a, Result<String, UpstreamError>> {
        Box::pin(async move {
            lock(&self.state).registrations.push(request.clone());
            if let Some(error) = &self.registration_error {
                return Err(error.clone());
            }
            Ok(format!("jit-{}", request.runner_name))
        })
    }

    fn check_connectivity(&self) -> BoxFuture<'_, Connectivity> {
        Box::pin(async move {
            lock(&self.state).connectivity_checks += 1;
            self.connectivity.clone()
        })
    }
}

// Build pipelines
#[derive(Default)]
struct BuildState {
    pipelines: Map<String, String>,
    builds: Map<String, Vec<BuildInfo>>,
    images: Map<String, String>,
    pipeline_lookups: Vec<String>,
}

#[derive(Default)]
pub struct FakeBuilds {
    state: Mutex<BuildState>,
}

impl FakeBuilds {
    pub fn add_pipeline(&self, name: &str, builds: Vec<BuildInfo>) {
        let mut state = lock(&self.state);
        let pipeline_id = format!("arn:pipeline/{name}");
        state.pipelines.insert(name.to_string(), pipeline_id.clone());
        state.builds.insert(pipeline_id, builds);
    }

    pub fn add_image(&self, build_id: &str, image_id: &str) {
        lock(&self.state)
            .images
            .insert(build_id.to_string(), image_id.to_string());
    }

    pub fn pipeline_lookups(&self) -> Vec<String> {
        lock(&self.state).pipeline_lookups.clone()
    }
}

impl BuildPipelineHandler for FakeBuilds {
    fn find_pipeline<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BuildResult<Option<String>>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.pipeline_lookups.push(name.to_string());
            Ok(state.pipelines.get(name).cloned())
        })
    }

    fn list_builds<'a>(&'a self, pipeline_id: &'a str) -> BoxFuture<'a, BuildResult<Vec<BuildInfo>>> {
        Box::pin(async move {
            Ok(lock(&self.state)
                .builds
                .get(pipeline_id)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn build_image<'a>(&'a self, build_id: &'a str) -> BoxFuture<'a, BuildResult<Option<String>>> {
        Box::pin(async move { Ok(lock(&self.state).images.get(build_id).cloned()) })
    }
}
