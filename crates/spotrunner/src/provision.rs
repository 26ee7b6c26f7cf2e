//! Turns a routed job into exactly one worker machine.
//!
//! Spot capacity is requested through a single instant fleet. Whether a failed or empty fleet
//! falls back to an on-demand launch is decided by the spot policy of the profile:
//!
//! | policy          | fleet has capacity | fleet empty or failed   |
//! |-----------------|--------------------|-------------------------|
//! | `spotOnly`      | spot worker        | capacity error          |
//! | `spotPreferred` | spot worker        | on-demand worker        |
//! | `onDemandOnly`  | (no fleet request) | (no fleet request)      |
use thiserror::Error;

use spotrunner_boot::payload::{
    BootPayload, PAYLOAD_VERSION, PreemptionSettings, RunnerInstall, default_shutdown_command,
    render_user_data,
};

use crate::common::clock::ClockRef;
use crate::common::config::RunnerConfig;
use crate::compute::tags::WorkerTags;
use crate::compute::{
    ComputeHandlerRef, FleetRequest, InstanceRequirements, LaunchSpec, LaunchedInstance,
    OnDemandRequest,
};
use crate::router::labels::LabelOptions;
use crate::router::profile::{MachineProfile, SpotPolicy};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Profile `{0}` has no usable image")]
    NoImage(String),
    #[error("No spot capacity available: {0}")]
    InsufficientCapacity(String),
    #[error("Cannot launch on-demand instance: {0:#}")]
    Launch(anyhow::Error),
    #[error("Cannot create boot payload: {0}")]
    Payload(String),
}

/// Job that should get a worker.
#[derive(Debug)]
pub struct ProvisionRequest<'a> {
    pub job_id: &'a str,
    pub repo_full_name: &'a str,
    pub workflow_name: &'a str,
    pub labels: &'a [String],
    pub profile: &'a MachineProfile,
    pub options: &'a LabelOptions,
    /// Single-use runner registration credential.
    pub jit_config: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedWorker {
    pub instance_id: String,
    pub instance_type: String,
    pub spot: bool,
}

impl ProvisionedWorker {
    fn new(instance: LaunchedInstance, spot: bool) -> Self {
        Self {
            instance_id: instance.instance_id,
            instance_type: instance.instance_type,
            spot,
        }
    }
}

pub struct Provisioner {
    compute: ComputeHandlerRef,
    runner: RunnerConfig,
    clock: ClockRef,
}

impl Provisioner {
    pub fn new(compute: ComputeHandlerRef, runner: RunnerConfig, clock: ClockRef) -> Self {
        Self {
            compute,
            runner,
            clock,
        }
    }

    pub fn boot_payload(&self, request: &ProvisionRequest) -> BootPayload {
        let architecture = request.profile.architecture;
        let sha256 = match self.runner.checksums.get(&architecture) {
            Some(checksum) => checksum.clone(),
            None => {
                log::warn!(
                    "No runner checksum configured for {}, workers can only use a preinstalled runner",
                    architecture.runner_name()
                );
                String::new()
            }
        };
        BootPayload {
            version: PAYLOAD_VERSION,
            job_id: request.job_id.to_string(),
            jit_config: request.jit_config.to_string(),
            timeout_secs: request.profile.timeout().as_secs(),
            runner: RunnerInstall {
                version: self.runner.version.clone(),
                download_url: self.runner.download_url_for(architecture),
                sha256,
                install_dir: self.runner.install_dir.clone(),
            },
            preemption: PreemptionSettings {
                poll_interval_secs: self.runner.preemption_poll_interval.as_secs(),
                grace_period_secs: self.runner.preemption_grace_period.as_secs(),
                ..Default::default()
            },
            shutdown_command: default_shutdown_command(),
        }
    }

    fn launch_spec(&self, request: &ProvisionRequest) -> Result<LaunchSpec, ProvisionError> {
        let profile = request.profile;
        let image_id = profile
            .usable_image()
            .ok_or_else(|| ProvisionError::NoImage(profile.name.clone()))?;
        let user_data = render_user_data(&self.boot_payload(request), &self.runner.agent_path)
            .map_err(|e| ProvisionError::Payload(e.to_string()))?;
        let tags = WorkerTags {
            job_id: request.job_id,
            repository: request.repo_full_name,
            workflow: request.workflow_name,
            labels: request.labels,
            profile: &profile.name,
            policy: profile.spot_policy,
            provisioned_at: self.clock.now(),
        }
        .to_tags();
        Ok(LaunchSpec {
            job_id: request.job_id.to_string(),
            image_id: image_id.to_string(),
            disk_size_gb: profile.disk_size_gb,
            user_data,
            tags,
        })
    }

    async fn launch_on_demand(
        &self,
        spec: LaunchSpec,
        profile: &MachineProfile,
    ) -> Result<ProvisionedWorker, ProvisionError> {
        let instance_type = profile
            .instance_types
            .first()
            .cloned()
            .ok_or_else(|| ProvisionError::Launch(anyhow::anyhow!("No instance type")))?;
        let request = OnDemandRequest {
            spec,
            instance_type,
        };
        let instance = self
            .compute
            .run_instance(&request)
            .await
            .map_err(ProvisionError::Launch)?;
        Ok(ProvisionedWorker::new(instance, false))
    }

    pub async fn provision(
        &self,
        request: &ProvisionRequest<'_>,
    ) -> Result<ProvisionedWorker, ProvisionError> {
        let profile = request.profile;
        let spec = self.launch_spec(request)?;

        if profile.spot_policy == SpotPolicy::OnDemandOnly {
            return self.launch_on_demand(spec, profile).await;
        }

        let fleet = FleetRequest {
            spec,
            instance_types: profile.instance_types.clone(),
            requirements: requirements(request.options),
        };
        let reason = match self.compute.create_fleet(&fleet).await {
            Ok(Some(instance)) => {
                log::info!(
                    "Job {} got spot instance {} ({})",
                    request.job_id,
                    instance.instance_id,
                    instance.instance_type
                );
                return Ok(ProvisionedWorker::new(instance, true));
            }
            Ok(None) => "fleet returned no instance".to_string(),
            Err(error) => format!("{error:#}"),
        };

        match profile.spot_policy {
            SpotPolicy::SpotPreferred => {
                log::warn!(
                    "No spot capacity for job {} ({reason}), falling back to on-demand",
                    request.job_id
                );
                self.launch_on_demand(fleet.spec, profile).await
            }
            _ => Err(ProvisionError::InsufficientCapacity(reason)),
        }
    }
}

fn requirements(options: &LabelOptions) -> Option<InstanceRequirements> {
    if options.is_empty() {
        return None;
    }
    Some(InstanceRequirements {
        vcpu: options.cpu,
        memory_gib: options.ram_gb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::tags::{TAG_JOB_ID, TAG_SPOT_POLICY};
    use crate::router::profile::{Architecture, IMAGE_NOT_BUILT};
    use crate::tests::{FakeCompute, FleetBehavior, test_clock, test_profile};
    use std::sync::Arc;

    fn provisioner(compute: Arc<FakeCompute>) -> Provisioner {
        let mut runner = RunnerConfig::default();
        runner.checksums.insert(Architecture::X64, "ab".repeat(32));
        Provisioner::new(compute, runner, test_clock())
    }

    fn request<'a>(profile: &'a MachineProfile, options: &'a LabelOptions) -> ProvisionRequest<'a> {
        ProvisionRequest {
            job_id: "42",
            repo_full_name: "octo/widgets",
            workflow_name: "CI",
            labels: &[],
            profile,
            options,
            jit_config: "jit",
        }
    }

    async fn run(policy: SpotPolicy, fleet: FleetBehavior) -> (Result<ProvisionedWorker, ProvisionError>, Arc<FakeCompute>) {
        let compute = Arc::new(FakeCompute::new(fleet));
        let mut profile = test_profile("linux");
        profile.spot_policy = policy;
        let options = LabelOptions::default();
        let result = provisioner(compute.clone())
            .provision(&request(&profile, &options))
            .await;
        (result, compute)
    }

    #[tokio::test]
    async fn spot_capacity_is_used() {
        for policy in [SpotPolicy::SpotOnly, SpotPolicy::SpotPreferred] {
            let (result, compute) = run(policy, FleetBehavior::Launch).await;
            let worker = result.unwrap();
            assert!(worker.spot);
            assert_eq!(worker.instance_id, "i-spot");
            assert_eq!(compute.fleet_requests().len(), 1);
            assert!(compute.on_demand_requests().is_empty());
        }
    }

    #[tokio::test]
    async fn spot_preferred_falls_back() {
        for fleet in [FleetBehavior::NoCapacity, FleetBehavior::Fail] {
            let (result, compute) = run(SpotPolicy::SpotPreferred, fleet).await;
            let worker = result.unwrap();
            assert!(!worker.spot);
            assert_eq!(worker.instance_id, "i-ondemand");
            assert_eq!(compute.fleet_requests().len(), 1);
            let on_demand = compute.on_demand_requests();
            assert_eq!(on_demand.len(), 1);
            assert_eq!(on_demand[0].instance_type, "c7i.large");
        }
    }

    #[tokio::test]
    async fn spot_only_does_not_fall_back() {
        for fleet in [FleetBehavior::NoCapacity, FleetBehavior::Fail] {
            let (result, compute) = run(SpotPolicy::SpotOnly, fleet).await;
            assert!(matches!(result, Err(ProvisionError::InsufficientCapacity(_))));
            assert!(compute.on_demand_requests().is_empty());
        }
    }

    #[tokio::test]
    async fn on_demand_only_skips_fleet() {
        let (result, compute) = run(SpotPolicy::OnDemandOnly, FleetBehavior::Launch).await;
        assert!(!result.unwrap().spot);
        assert!(compute.fleet_requests().is_empty());
        assert_eq!(compute.on_demand_requests().len(), 1);
    }

    #[tokio::test]
    async fn failed_on_demand_launch() {
        let compute = Arc::new(FakeCompute::new(FleetBehavior::NoCapacity).fail_on_demand());
        let profile = test_profile("linux");
        let options = LabelOptions::default();
        let result = provisioner(compute)
            .provision(&request(&profile, &options))
            .await;
        assert!(matches!(result, Err(ProvisionError::Launch(_))));
    }

    #[tokio::test]
    async fn fleet_request_contents() {
        let compute = Arc::new(FakeCompute::new(FleetBehavior::Launch));
        let profile = test_profile("linux");
        let options = LabelOptions {
            cpu: Some(4),
            ram_gb: None,
        };
        provisioner(compute.clone())
            .provision(&request(&profile, &options))
            .await
            .unwrap();

        let fleet = compute.fleet_requests().remove(0);
        assert_eq!(fleet.instance_types, vec!["c7i.large", "c6i.large"]);
        assert_eq!(
            fleet.requirements,
            Some(InstanceRequirements {
                vcpu: Some(4),
                memory_gib: None
            })
        );
        assert_eq!(fleet.spec.image_id, "ami-linux");
        assert_eq!(fleet.spec.disk_size_gb, 30);
        assert!(fleet
            .spec
            .tags
            .contains(&(TAG_JOB_ID.to_string(), "42".to_string())));
        assert!(fleet
            .spec
            .tags
            .contains(&(TAG_SPOT_POLICY.to_string(), "spotPreferred".to_string())));
        assert!(fleet.spec.user_data.ends_with("shutdown -h now\n"));
    }

    #[tokio::test]
    async fn refuse_profile_without_image() {
        let compute = Arc::new(FakeCompute::new(FleetBehavior::Launch));
        let mut profile = test_profile("linux");
        profile.image_id = Some(IMAGE_NOT_BUILT.to_string());
        let options = LabelOptions::default();
        let result = provisioner(compute.clone())
            .provision(&request(&profile, &options))
            .await;
        assert!(matches!(result, Err(ProvisionError::NoImage(_))));
        assert!(compute.fleet_requests().is_empty());
    }

    #[test]
    fn payload_carries_runner_settings() {
        let compute = Arc::new(FakeCompute::new(FleetBehavior::Launch));
        let mut profile = test_profile("linux");
        profile.timeout_minutes = 90;
        let options = LabelOptions::default();
        let payload = provisioner(compute).boot_payload(&request(&profile, &options));
        assert_eq!(payload.jit_config, "jit");
        assert_eq!(payload.timeout_secs, 90 * 60);
        assert_eq!(payload.runner.sha256, "ab".repeat(32));
        assert!(payload.runner.download_url.contains("linux-x64-2.321.0"));
        assert_eq!(payload.preemption.grace_period_secs, 90);
        assert_eq!(payload.shutdown_command, vec!["shutdown", "-h", "now"]);
    }
}
