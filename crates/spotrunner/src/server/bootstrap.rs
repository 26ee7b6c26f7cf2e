use std::sync::Arc;

use crate::build::BuildPipelineHandlerRef;
use crate::build::imagebuilder::ImageBuilderHandler;
use crate::common::clock::{ClockRef, system_clock};
use crate::common::config::SpotrunnerConfig;
use crate::compute::ComputeHandlerRef;
use crate::compute::ec2::Ec2Handler;
use crate::intake::JobIntake;
use crate::provision::Provisioner;
use crate::reconcile::images::ImageReconciler;
use crate::reconcile::jobs::JobReconciler;
use crate::router::LabelRouter;
use crate::router::store::{DirProfileStore, ProfileStoreRef};
use crate::status::StatusAggregator;
use crate::store::{ImageStateStoreRef, LifecycleStoreRef, open_stores};
use crate::upstream::UpstreamClientRef;
use crate::upstream::github::GitHubAppClient;

/// Collaborators shared by every unit of work, wired from the configuration.
#[derive(Clone)]
pub struct Components {
    pub config: SpotrunnerConfig,
    pub clock: ClockRef,
    pub jobs: LifecycleStoreRef,
    pub images: ImageStateStoreRef,
    pub profiles: ProfileStoreRef,
    /// Missing when the app credentials are not configured.
    pub upstream: Option<UpstreamClientRef>,
    pub compute: ComputeHandlerRef,
    pub builds: BuildPipelineHandlerRef,
}

impl Components {
    pub fn from_config(config: SpotrunnerConfig) -> crate::Result<Self> {
        let clock = system_clock();
        let (jobs, images) = open_stores(config.store.database.as_deref(), clock.clone())?;
        let profiles: ProfileStoreRef =
            Arc::new(DirProfileStore::new(config.store.profiles_dir.clone()));
        let upstream = match GitHubAppClient::from_config(&config.github, clock.clone())? {
            Some(client) => Some(Arc::new(client) as UpstreamClientRef),
            None => {
                log::warn!("GitHub app credentials are not configured, deliveries will be rejected");
                None
            }
        };
        let compute: ComputeHandlerRef =
            Arc::new(Ec2Handler::new(config.compute.clone(), clock.clone()));
        let builds: BuildPipelineHandlerRef = Arc::new(ImageBuilderHandler::new(
            config.compute.aws_cli.clone(),
            config.compute.region.clone(),
        ));
        Ok(Self {
            config,
            clock,
            jobs,
            images,
            profiles,
            upstream,
            compute,
            builds,
        })
    }

    pub fn intake(&self) -> JobIntake {
        let provisioner = Provisioner::new(
            self.compute.clone(),
            self.config.runner.clone(),
            self.clock.clone(),
        );
        JobIntake::new(
            self.config.github.webhook_secret.clone(),
            self.upstream.clone(),
            LabelRouter::new(self.config.routing.namespace.clone(), self.profiles.clone()),
            self.jobs.clone(),
            provisioner,
            self.clock.clone(),
            self.config.policy.retention,
        )
    }

    pub fn job_reconciler(&self) -> JobReconciler {
        JobReconciler::new(
            self.jobs.clone(),
            self.profiles.clone(),
            self.compute.clone(),
            self.clock.clone(),
            self.config.policy.provisioning_deadline,
            self.config.policy.job_timeout,
        )
    }

    pub fn image_reconciler(&self) -> ImageReconciler {
        ImageReconciler::new(
            self.images.clone(),
            self.profiles.clone(),
            self.builds.clone(),
            self.clock.clone(),
            self.config.images.pipeline_prefix.clone(),
            self.config.policy.image_staleness,
        )
    }

    pub fn status_aggregator(&self, reconciler: Option<Arc<ImageReconciler>>) -> StatusAggregator {
        StatusAggregator::new(
            self.images.clone(),
            self.upstream.clone(),
            reconciler,
            self.clock.clone(),
            self.config.policy.connectivity_ttl,
            self.config.policy.image_reconcile_ttl,
        )
    }
}
