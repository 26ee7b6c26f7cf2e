use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::build::{BuildPipelineHandlerRef, BuildStatus, newest_build};
use crate::common::clock::ClockRef;
use crate::common::timeutils::to_chrono;
use crate::images::{ApplyOutcome, BuildEvent, apply_build_event};
use crate::reconcile::jobs::ReconcileFailure;
use crate::router::store::ProfileStoreRef;
use crate::store::ImageStateStoreRef;
use crate::store::records::{ImageStateRecord, ImageStatus};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImageReconcileReport {
    /// Profiles whose stale `building` record was inspected.
    pub checked: Vec<String>,
    /// Profiles whose record was rewritten.
    pub updated: Vec<String>,
    pub failures: Vec<ReconcileFailure>,
}

/// Corrects image records that stay in `building` because a build signal was lost.
pub struct ImageReconciler {
    images: ImageStateStoreRef,
    profiles: ProfileStoreRef,
    builds: BuildPipelineHandlerRef,
    clock: ClockRef,
    pipeline_prefix: String,
    staleness: Duration,
}

impl ImageReconciler {
    pub fn new(
        images: ImageStateStoreRef,
        profiles: ProfileStoreRef,
        builds: BuildPipelineHandlerRef,
        clock: ClockRef,
        pipeline_prefix: String,
        staleness: Duration,
    ) -> Self {
        Self {
            images,
            profiles,
            builds,
            clock,
            pipeline_prefix,
            staleness,
        }
    }

    pub fn pipeline_name(&self, profile_name: &str) -> String {
        format!("{}-{profile_name}", self.pipeline_prefix)
    }

    pub async fn reconcile(&self) -> crate::Result<ImageReconcileReport> {
        // All writes of a pass carry its start time
        let started_at = self.clock.now();
        let threshold = to_chrono(self.staleness);
        let mut report = ImageReconcileReport::default();

        for record in self.images.list_images()? {
            if record.status != ImageStatus::Building || started_at - record.updated_at <= threshold
            {
                continue;
            }
            report.checked.push(record.profile_name.clone());
            match self.reconcile_record(&record, started_at).await {
                Ok(true) => report.updated.push(record.profile_name),
                Ok(false) => {}
                Err(error) => {
                    log::error!(
                        "Cannot reconcile image of profile `{}`: {error:#}",
                        record.profile_name
                    );
                    report.failures.push(ReconcileFailure {
                        target: record.profile_name,
                        message: format!("{error:#}"),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn reconcile_record(
        &self,
        record: &ImageStateRecord,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let profile = &record.profile_name;
        let pipeline_name = self.pipeline_name(profile);
        let Some(pipeline_id) = self.builds.find_pipeline(&pipeline_name).await? else {
            log::warn!("Build pipeline `{pipeline_name}` of profile `{profile}` does not exist");
            return Ok(false);
        };
        let builds = self.builds.list_builds(&pipeline_id).await?;
        let Some(build) = newest_build(&builds) else {
            log::warn!("Build pipeline `{pipeline_name}` has no builds");
            return Ok(false);
        };

        let (status, image_id, error) = match &build.status {
            BuildStatus::Succeeded => match self.builds.build_image(&build.build_id).await? {
                Some(image_id) => (ImageStatus::Ready, Some(image_id), None),
                None => {
                    return Err(anyhow::anyhow!(
                        "Build {} succeeded without an image",
                        build.build_id
                    ));
                }
            },
            BuildStatus::Failed | BuildStatus::Cancelled => (
                ImageStatus::Failed,
                None,
                Some(
                    build
                        .reason
                        .clone()
                        .unwrap_or_else(|| format!("Build {} did not finish", build.build_id)),
                ),
            ),
            BuildStatus::InProgress | BuildStatus::Other(_) => {
                log::debug!("Build {} of profile `{profile}` is still running", build.build_id);
                return Ok(false);
            }
        };

        let event = BuildEvent {
            profile: profile.clone(),
            status,
            image_id,
            build_id: Some(build.build_id.clone()),
            error,
            timestamp: started_at,
        };
        let outcome = apply_build_event(self.images.as_ref(), self.profiles.as_ref(), &event)?;
        if outcome == ApplyOutcome::Applied {
            log::info!("Image of profile `{profile}` reconciled to {status}");
        }
        Ok(outcome == ApplyOutcome::Applied)
    }
}
