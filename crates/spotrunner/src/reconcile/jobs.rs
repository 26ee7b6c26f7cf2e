use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{Map, Set};
use crate::common::clock::ClockRef;
use crate::common::timeutils::to_chrono;
use crate::compute::tags::TAG_JOB_ID;
use crate::compute::{ComputeHandlerRef, TaggedInstance, TerminateOutcome};
use crate::router::profile::MachineProfile;
use crate::router::store::ProfileStoreRef;
use crate::store::LifecycleStoreRef;
use crate::store::records::{JobRecord, JobRecordUpdate, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileFailure {
    /// Job or instance the failure relates to.
    pub target: String,
    pub message: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JobReconcileReport {
    pub completed: Vec<String>,
    pub interrupted: Vec<String>,
    pub timed_out: Vec<String>,
    /// Instances terminated because no record claims them.
    pub orphans: Vec<String>,
    pub purged: usize,
    pub failures: Vec<ReconcileFailure>,
}

impl JobReconcileReport {
    fn fail(&mut self, target: &str, message: String) {
        log::error!("Reconciliation of {target} failed: {message}");
        self.failures.push(ReconcileFailure {
            target: target.to_string(),
            message,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
            && self.interrupted.is_empty()
            && self.timed_out.is_empty()
            && self.orphans.is_empty()
            && self.purged == 0
            && self.failures.is_empty()
    }
}

/// Cleans up workers whose jobs got stuck, finished or were lost.
pub struct JobReconciler {
    jobs: LifecycleStoreRef,
    profiles: ProfileStoreRef,
    compute: ComputeHandlerRef,
    clock: ClockRef,
    provisioning_deadline: Duration,
    job_timeout: Duration,
}

impl JobReconciler {
    pub fn new(
        jobs: LifecycleStoreRef,
        profiles: ProfileStoreRef,
        compute: ComputeHandlerRef,
        clock: ClockRef,
        provisioning_deadline: Duration,
        job_timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            profiles,
            compute,
            clock,
            provisioning_deadline,
            job_timeout,
        }
    }

    pub async fn reconcile(&self) -> JobReconcileReport {
        let now = self.clock.now();
        let mut report = JobReconcileReport::default();

        let instances = match self.compute.list_tagged_instances().await {
            Ok(instances) => Some(instances),
            Err(error) => {
                report.fail("instance listing", format!("{error:#}"));
                None
            }
        };

        if let Some(instances) = &instances {
            self.detect_completion(instances, now, &mut report);
        }
        // Instances already handled by the timeout passes are skipped by the orphan pass
        let mut handled = Set::new();
        for status in [JobStatus::Pending, JobStatus::Provisioning, JobStatus::Running] {
            self.time_out(status, now, &mut handled, &mut report).await;
        }
        if let Some(instances) = &instances {
            self.terminate_orphans(instances, now, &handled, &mut report)
                .await;
        }

        match self.jobs.purge_expired(now.timestamp()) {
            Ok(purged) => report.purged = purged,
            Err(error) => report.fail("expired records", error.to_string()),
        }
        report
    }

    fn records(&self, status: JobStatus, report: &mut JobReconcileReport) -> Vec<JobRecord> {
        self.jobs.jobs_with_status(status).unwrap_or_else(|error| {
            report.fail(&format!("{status} jobs"), error.to_string());
            vec![]
        })
    }

    fn mark(
        &self,
        record: &JobRecord,
        next: JobStatus,
        message: Option<String>,
    ) -> crate::Result<bool> {
        if !record.status.can_transition_to(next) {
            log::debug!(
                "Job {} cannot move from {} to {next}",
                record.job_id,
                record.status
            );
            return Ok(false);
        }
        let mut update = JobRecordUpdate::status(next);
        update.error_message = message;
        Ok(self.jobs.update_job(&record.job_id, &update)?.is_some())
    }

    /// Running jobs whose worker is gone are finished. Workers reclaimed by the provider
    /// were interrupted.
    fn detect_completion(
        &self,
        instances: &[TaggedInstance],
        now: DateTime<Utc>,
        report: &mut JobReconcileReport,
    ) {
        let by_id: Map<&str, &TaggedInstance> = instances
            .iter()
            .map(|instance| (instance.instance_id.as_str(), instance))
            .collect();
        let grace = to_chrono(self.provisioning_deadline);

        for record in self.records(JobStatus::Running, report) {
            let Some(instance_id) = record.instance_id.as_deref() else {
                continue;
            };
            let (next, message) = match by_id.get(instance_id) {
                Some(instance) if instance.state.is_terminal() => {
                    if instance.was_interrupted() {
                        (
                            JobStatus::Interrupted,
                            Some("Spot instance was reclaimed".to_string()),
                        )
                    } else {
                        (JobStatus::Completed, None)
                    }
                }
                Some(_) => continue,
                // Terminated instances disappear from listings after a while
                None if now - record.updated_at > grace => (
                    JobStatus::Completed,
                    Some(format!("Instance {instance_id} no longer exists")),
                ),
                None => continue,
            };
            match self.mark(&record, next, message) {
                Ok(true) => {
                    log::info!("Job {} is {next}", record.job_id);
                    if next == JobStatus::Interrupted {
                        report.interrupted.push(record.job_id);
                    } else {
                        report.completed.push(record.job_id);
                    }
                }
                Ok(false) => {}
                Err(error) => report.fail(&record.job_id, error.to_string()),
            }
        }
    }

    fn running_timeout(&self, record: &JobRecord) -> Duration {
        match self.profiles.get(&record.profile_name) {
            Ok(Some(document)) => match MachineProfile::from_document(&record.profile_name, document)
            {
                Ok(profile) => profile.timeout(),
                Err(error) => {
                    log::warn!("{error}, using the default job timeout");
                    self.job_timeout
                }
            },
            Ok(None) => self.job_timeout,
            Err(error) => {
                log::warn!(
                    "Cannot read profile `{}`: {error}, using the default job timeout",
                    record.profile_name
                );
                self.job_timeout
            }
        }
    }

    async fn time_out(
        &self,
        status: JobStatus,
        now: DateTime<Utc>,
        handled: &mut Set<String>,
        report: &mut JobReconcileReport,
    ) {
        for record in self.records(status, report) {
            let (limit, reason) = if status == JobStatus::Running {
                (self.running_timeout(&record), "Job timeout exceeded")
            } else {
                (self.provisioning_deadline, "Provisioning deadline exceeded")
            };
            if now - record.updated_at <= to_chrono(limit) {
                continue;
            }
            if let Some(instance_id) = &record.instance_id {
                handled.insert(instance_id.clone());
                if let Err(error) = self.compute.terminate_instance(instance_id).await {
                    // The record keeps its status, so the next pass tries again
                    report.fail(instance_id, format!("{error:#}"));
                    continue;
                }
            }
            match self.mark(&record, JobStatus::Timeout, Some(reason.to_string())) {
                Ok(true) => {
                    log::warn!("Job {} timed out while {status}", record.job_id);
                    report.timed_out.push(record.job_id);
                }
                Ok(false) => {}
                Err(error) => report.fail(&record.job_id, error.to_string()),
            }
        }
    }

    fn is_orphan(&self, instance: &TaggedInstance, job_id: &str) -> crate::Result<bool> {
        Ok(match self.jobs.get_job(job_id)? {
            None => true,
            Some(record) => {
                record.status.is_terminal()
                    || record.instance_id.as_deref() != Some(instance.instance_id.as_str())
            }
        })
    }

    async fn terminate_orphans(
        &self,
        instances: &[TaggedInstance],
        now: DateTime<Utc>,
        handled: &Set<String>,
        report: &mut JobReconcileReport,
    ) {
        let grace = to_chrono(self.provisioning_deadline);
        for instance in instances {
            if instance.state.is_terminal()
                || now - instance.launch_time < grace
                || handled.contains(&instance.instance_id)
            {
                continue;
            }
            let Some(job_id) = instance.tag(TAG_JOB_ID) else {
                continue;
            };
            match self.is_orphan(instance, job_id) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(error) => {
                    report.fail(&instance.instance_id, error.to_string());
                    continue;
                }
            }
            match self.compute.terminate_instance(&instance.instance_id).await {
                Ok(outcome) => {
                    if outcome == TerminateOutcome::Terminated {
                        log::warn!(
                            "Terminated orphaned instance {} of job {job_id}",
                            instance.instance_id
                        );
                    }
                    report.orphans.push(instance.instance_id.clone());
                }
                Err(error) => report.fail(&instance.instance_id, format!("{error:#}")),
            }
        }
    }
}
