//! Scheduled clean-up of job and image records.
//!
//! Reconcilers never abort a pass because of a single bad record or instance. Failures are
//! collected in the pass report and retried on the next pass.
pub mod images;
pub mod jobs;

use std::sync::Arc;
use std::time::Duration;

use crate::reconcile::images::{ImageReconcileReport, ImageReconciler};
use crate::reconcile::jobs::{JobReconcileReport, JobReconciler};

pub fn log_job_report(report: &JobReconcileReport) {
    if report.is_empty() {
        log::debug!("Job reconciliation found nothing to do");
        return;
    }
    log::info!(
        "Job reconciliation: {} completed, {} interrupted, {} timed out, {} orphans terminated, {} records purged, {} failures",
        report.completed.len(),
        report.interrupted.len(),
        report.timed_out.len(),
        report.orphans.len(),
        report.purged,
        report.failures.len()
    );
}

pub fn log_image_report(report: &ImageReconcileReport) {
    if report.checked.is_empty() {
        return;
    }
    log::info!(
        "Image reconciliation: {} stale records, {} updated, {} failures",
        report.checked.len(),
        report.updated.len(),
        report.failures.len()
    );
}

/// Runs both reconcilers once.
pub async fn reconcile_once(jobs: &JobReconciler, images: Option<&ImageReconciler>) {
    log_job_report(&jobs.reconcile().await);
    if let Some(images) = images {
        match images.reconcile().await {
            Ok(report) => log_image_report(&report),
            Err(error) => log::error!("Image reconciliation failed: {error}"),
        }
    }
}

/// Periodically runs the reconcilers. Never returns, the caller decides when to stop it.
pub async fn reconcile_process(
    jobs: Arc<JobReconciler>,
    images: Option<Arc<ImageReconciler>>,
    interval: Duration,
) {
    log::info!(
        "Reconciling every {}",
        humantime::format_duration(interval)
    );
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        timer.tick().await;
        reconcile_once(&jobs, images.as_deref()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::InstanceState;
    use crate::router::store::MemoryProfileStore;
    use crate::store::LifecycleStore;
    use crate::store::memory::MemoryStore;
    use crate::store::records::{JobRecord, JobRecordUpdate, JobStatus};
    use crate::tests::{FakeBuilds, FakeCompute, FleetBehavior, tagged_instance, test_clock};

    #[tokio::test(start_paused = true)]
    async fn periodic_reconciliation() {
        let clock = test_clock();
        let jobs = Arc::new(MemoryStore::new(clock.clone()));
        let compute = Arc::new(FakeCompute::new(FleetBehavior::Launch));
        let profiles = Arc::new(MemoryProfileStore::new());
        let record = JobRecord::new_pending(
            "1".to_string(),
            "octo/widgets".to_string(),
            "CI".to_string(),
            vec![],
            "linux".to_string(),
            crate::tests::start_time(),
            Duration::from_secs(3600),
        );
        jobs.create_job(&record).unwrap();
        jobs.update_job(
            "1",
            &JobRecordUpdate::status(JobStatus::Running).with_instance(
                "i-1".to_string(),
                "c7i.large".to_string(),
                true,
            ),
        )
        .unwrap();

        let reconciler = Arc::new(JobReconciler::new(
            jobs.clone(),
            profiles.clone(),
            compute.clone(),
            clock.clone(),
            Duration::from_secs(600),
            Duration::from_secs(3600),
        ));
        let images = Arc::new(ImageReconciler::new(
            jobs.clone(),
            profiles,
            Arc::new(FakeBuilds::default()),
            clock.clone(),
            "spotrunner".to_string(),
            Duration::from_secs(1800),
        ));
        let process = tokio::spawn(reconcile_process(
            reconciler,
            Some(images),
            Duration::from_secs(60),
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(jobs.get_job("1").unwrap().unwrap().status, JobStatus::Running);

        compute.add_instance(tagged_instance(
            "i-1",
            "1",
            InstanceState::Terminated,
            crate::tests::start_time(),
        ));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            jobs.get_job("1").unwrap().unwrap().status,
            JobStatus::Completed
        );
        process.abort();
    }
}
