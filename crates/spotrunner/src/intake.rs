//! Entry point for `workflow_job` deliveries.
//!
//! A delivery is verified, routed and claimed before any upstream or compute call happens.
//! Only a claimed job gets a registration credential and a worker, so duplicate deliveries of
//! the same job are acknowledged without side effects.
use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::common::clock::ClockRef;
use crate::provision::{ProvisionError, ProvisionRequest, ProvisionedWorker, Provisioner};
use crate::router::profile::{MachineProfile, ProfileError};
use crate::router::{LabelRouter, RouteError, RouteOutcome, RoutedJob};
use crate::store::records::{JobRecord, JobRecordUpdate, JobStatus};
use crate::store::{ClaimOutcome, LifecycleStoreRef};
use crate::upstream::webhook::{
    QUEUED_ACTION, SignatureError, WORKFLOW_JOB_EVENT, WorkflowJobEvent, verify_signature,
};
use crate::upstream::{RegistrationRequest, UpstreamClientRef, UpstreamError};

/// Raw delivery as received by the HTTP surface.
#[derive(Debug, Default, Clone, Copy)]
pub struct Delivery<'a> {
    pub event: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub delivery_id: Option<&'a str>,
    pub body: &'a [u8],
}

/// Reasons for acknowledging a delivery without doing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    OtherEvent(String),
    OtherAction(String),
    MalformedPayload,
    NoRoute,
    NoConfiguration(String),
    ImageNotReady(String),
    MissingInstallation,
    AlreadyClaimed,
}

impl IgnoreReason {
    pub fn message(&self) -> String {
        match self {
            IgnoreReason::OtherEvent(event) => format!("Ignoring `{event}` event"),
            IgnoreReason::OtherAction(action) => format!("Ignoring `{action}` action"),
            IgnoreReason::MalformedPayload => "Ignoring malformed payload".to_string(),
            IgnoreReason::NoRoute => "No routing label".to_string(),
            IgnoreReason::NoConfiguration(profile) => {
                format!("No configuration for profile `{profile}`")
            }
            IgnoreReason::ImageNotReady(profile) => {
                format!("Image of profile `{profile}` is not ready")
            }
            IgnoreReason::MissingInstallation => "Delivery has no installation".to_string(),
            IgnoreReason::AlreadyClaimed => "Job is already handled".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    Ignored(IgnoreReason),
    Provisioned(ProvisionedWorker),
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Invalid signature: {0}")]
    Unauthorized(#[from] SignatureError),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error(transparent)]
    InvalidProfile(#[from] ProfileError),
    #[error("Store error: {0}")]
    Store(#[from] crate::Error),
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

impl IntakeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IntakeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            IntakeError::NotConfigured(_) | IntakeError::InvalidProfile(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            IntakeError::Store(_) | IntakeError::Upstream(_) | IntakeError::Provision(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message returned to the sender. Details stay in the log.
    fn public_message(&self) -> &'static str {
        match self {
            IntakeError::Unauthorized(_) => "Invalid signature",
            IntakeError::NotConfigured(_) | IntakeError::InvalidProfile(_) => {
                "Service is not configured"
            }
            IntakeError::Store(_) | IntakeError::Upstream(_) | IntakeError::Provision(_) => {
                "Provisioning failed"
            }
        }
    }
}

impl IntoResponse for IntakeError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({ "error": self.public_message() })),
        )
            .into_response()
    }
}

impl IntoResponse for IntakeOutcome {
    fn into_response(self) -> Response {
        let body = match self {
            IntakeOutcome::Ignored(reason) => json!({ "message": reason.message() }),
            IntakeOutcome::Provisioned(worker) => json!({
                "instanceId": worker.instance_id,
                "instanceType": worker.instance_type,
                "isSpot": worker.spot,
            }),
        };
        (StatusCode::OK, Json(body)).into_response()
    }
}

/// Registration labels: job labels followed by the profile labels they do not contain.
fn registration_labels(job_labels: &[String], profile: &MachineProfile) -> Vec<String> {
    let mut labels: Vec<String> = Vec::with_capacity(job_labels.len() + profile.labels.len());
    for label in job_labels.iter().chain(profile.labels.iter()) {
        if !labels.iter().any(|l| l.eq_ignore_ascii_case(label)) {
            labels.push(label.clone());
        }
    }
    labels
}

pub struct JobIntake {
    webhook_secret: Option<String>,
    upstream: Option<UpstreamClientRef>,
    router: LabelRouter,
    jobs: LifecycleStoreRef,
    provisioner: Provisioner,
    clock: ClockRef,
    retention: Duration,
}

impl JobIntake {
    pub fn new(
        webhook_secret: Option<String>,
        upstream: Option<UpstreamClientRef>,
        router: LabelRouter,
        jobs: LifecycleStoreRef,
        provisioner: Provisioner,
        clock: ClockRef,
        retention: Duration,
    ) -> Self {
        Self {
            webhook_secret: webhook_secret.filter(|secret| !secret.is_empty()),
            upstream,
            router,
            jobs,
            provisioner,
            clock,
            retention,
        }
    }

    pub async fn handle(&self, delivery: Delivery<'_>) -> Result<IntakeOutcome, IntakeError> {
        let secret = self
            .webhook_secret
            .as_ref()
            .ok_or(IntakeError::NotConfigured("Webhook secret"))?;
        verify_signature(secret.as_bytes(), delivery.body, delivery.signature)?;
        let upstream = self
            .upstream
            .as_ref()
            .ok_or(IntakeError::NotConfigured("GitHub app"))?;

        let event_name = delivery.event.unwrap_or_default();
        if event_name != WORKFLOW_JOB_EVENT {
            return Ok(IntakeOutcome::Ignored(IgnoreReason::OtherEvent(
                event_name.to_string(),
            )));
        }
        let event = match WorkflowJobEvent::parse(delivery.body) {
            Ok(event) => event,
            Err(error) => {
                log::warn!(
                    "Malformed workflow_job payload (delivery {}): {error}",
                    delivery.delivery_id.unwrap_or("?")
                );
                return Ok(IntakeOutcome::Ignored(IgnoreReason::MalformedPayload));
            }
        };
        if event.action != QUEUED_ACTION {
            return Ok(IntakeOutcome::Ignored(IgnoreReason::OtherAction(
                event.action,
            )));
        }

        let job_id = event.job_id();
        let routed = match self.router.route(&event.workflow_job.labels) {
            Ok(RouteOutcome::Routed(routed)) => routed,
            Ok(RouteOutcome::NoRoute) => {
                log::debug!("Job {job_id} has no routing label");
                return Ok(IntakeOutcome::Ignored(IgnoreReason::NoRoute));
            }
            Ok(RouteOutcome::NoConfiguration { requested }) => {
                log::warn!("Job {job_id} requests profile `{requested}` that does not exist");
                return Ok(IntakeOutcome::Ignored(IgnoreReason::NoConfiguration(
                    requested,
                )));
            }
            Err(RouteError::InvalidProfile(error)) => {
                log::error!("Job {job_id} cannot be routed: {error}");
                return Err(error.into());
            }
            Err(RouteError::Store(error)) => {
                log::error!("Job {job_id} cannot be routed: {error}");
                return Err(IntakeError::NotConfigured("Profile configuration"));
            }
        };
        if routed.profile.usable_image().is_none() {
            log::info!(
                "Image of profile `{}` is not built yet, ignoring job {job_id}",
                routed.profile.name
            );
            return Ok(IntakeOutcome::Ignored(IgnoreReason::ImageNotReady(
                routed.profile.name,
            )));
        }
        let Some(installation) = event.installation.as_ref() else {
            log::warn!("Job {job_id} was delivered without an installation");
            return Ok(IntakeOutcome::Ignored(IgnoreReason::MissingInstallation));
        };

        if self.jobs.get_job(&job_id)?.is_some() {
            log::debug!("Job {job_id} is already known");
            return Ok(IntakeOutcome::Ignored(IgnoreReason::AlreadyClaimed));
        }
        let record = JobRecord::new_pending(
            job_id.clone(),
            event.repository.full_name.clone(),
            event.workflow_name(),
            event.workflow_job.labels.clone(),
            routed.profile.name.clone(),
            self.clock.now(),
            self.retention,
        );
        if self.jobs.create_job(&record)? == ClaimOutcome::AlreadyClaimed {
            log::debug!("Job {job_id} was claimed by another delivery");
            return Ok(IntakeOutcome::Ignored(IgnoreReason::AlreadyClaimed));
        }
        log::info!(
            "Claimed job {job_id} of {} for profile `{}`",
            record.repo_full_name,
            record.profile_name
        );

        let mut status = JobStatus::Pending;
        match self
            .start_worker(upstream, installation.id, &record, &routed, &mut status)
            .await
        {
            Ok(worker) => {
                self.advance(
                    &job_id,
                    status,
                    JobRecordUpdate::status(JobStatus::Running).with_instance(
                        worker.instance_id.clone(),
                        worker.instance_type.clone(),
                        worker.spot,
                    ),
                )?;
                log::info!(
                    "Job {job_id} runs on {} ({}, spot: {})",
                    worker.instance_id,
                    worker.instance_type,
                    worker.spot
                );
                Ok(IntakeOutcome::Provisioned(worker))
            }
            Err(error) => {
                log::error!("Provisioning of job {job_id} failed: {error}");
                if let Err(store_error) = self.advance(
                    &job_id,
                    status,
                    JobRecordUpdate::status(JobStatus::Failed).with_error(error.to_string()),
                ) {
                    log::error!("Cannot mark job {job_id} as failed: {store_error}");
                }
                Err(error)
            }
        }
    }

    /// Obtains the registration credential and launches the worker. `status` tracks the status
    /// the record reached.
    async fn start_worker(
        &self,
        upstream: &UpstreamClientRef,
        installation_id: u64,
        record: &JobRecord,
        routed: &RoutedJob,
        status: &mut JobStatus,
    ) -> Result<ProvisionedWorker, IntakeError> {
        let profile = &routed.profile;
        let token = upstream.installation_token(installation_id).await?;
        let registration = RegistrationRequest {
            repo_full_name: record.repo_full_name.clone(),
            runner_name: format!("{}-{}", profile.name, record.job_id),
            labels: registration_labels(&record.labels, profile),
        };
        let jit_config = upstream.registration_config(&token, &registration).await?;

        self.advance(
            &record.job_id,
            *status,
            JobRecordUpdate::status(JobStatus::Provisioning),
        )?;
        *status = JobStatus::Provisioning;

        let request = ProvisionRequest {
            job_id: &record.job_id,
            repo_full_name: &record.repo_full_name,
            workflow_name: &record.workflow_name,
            labels: &record.labels,
            profile,
            options: &routed.options,
            jit_config: &jit_config,
        };
        Ok(self.provisioner.provision(&request).await?)
    }

    fn advance(&self, job_id: &str, from: JobStatus, update: JobRecordUpdate) -> crate::Result<()> {
        if let Some(next) = update.status {
            if !from.can_transition_to(next) {
                return crate::common::error::error(format!(
                    "Job {job_id} cannot move from {from} to {next}"
                ));
            }
        }
        match self.jobs.update_job(job_id, &update)? {
            Some(_) => Ok(()),
            None => crate::common::error::error(format!("Record of job {job_id} disappeared")),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::common::clock::ManualClock;
    use crate::common::config::RunnerConfig;
    use crate::router::profile::{IMAGE_NOT_BUILT, SpotPolicy};
    use crate::router::store::{MemoryProfileStore, ProfileStore};
    use crate::store::LifecycleStore;
    use crate::store::memory::MemoryStore;
    use crate::tests::{
        FakeCompute, FakeUpstream, FleetBehavior, profile_document, test_clock, test_profile,
    };
    use crate::upstream::webhook::sign;
    use crate::upstream::webhook::tests::queued_event;
    use derive_builder::Builder;
    use std::sync::Arc;

    pub const SECRET: &str = "webhook-secret";

    #[derive(Builder)]
    #[builder(pattern = "owned", build_fn(name = "finish"))]
    pub struct Fixture {
        #[builder(default = "Some(SECRET.to_string())")]
        secret: Option<String>,
        #[builder(default = "Some(Arc::new(FakeUpstream::default()))")]
        upstream: Option<Arc<FakeUpstream>>,
        #[builder(default = "Arc::new(FakeCompute::new(FleetBehavior::Launch))")]
        compute: Arc<FakeCompute>,
        #[builder(default = "vec![test_profile(\"linux\")]")]
        profiles: Vec<MachineProfile>,
    }

    pub struct TestIntake {
        pub intake: JobIntake,
        pub upstream: Option<Arc<FakeUpstream>>,
        pub compute: Arc<FakeCompute>,
        pub jobs: Arc<MemoryStore>,
        pub profiles: Arc<MemoryProfileStore>,
        pub clock: Arc<ManualClock>,
    }

    impl FixtureBuilder {
        pub fn build(self) -> TestIntake {
            let fixture = self.finish().unwrap();
            let clock = test_clock();
            let profiles = Arc::new(MemoryProfileStore::new());
            for profile in &fixture.profiles {
                profiles
                    .put(&profile.name, &profile_document(profile))
                    .unwrap();
            }
            let jobs = Arc::new(MemoryStore::new(clock.clone()));
            let mut runner = RunnerConfig::default();
            runner
                .checksums
                .insert(crate::router::profile::Architecture::X64, "ab".repeat(32));
            let intake = JobIntake::new(
                fixture.secret,
                fixture
                    .upstream
                    .clone()
                    .map(|upstream| upstream as UpstreamClientRef),
                LabelRouter::new("spotrunner".to_string(), profiles.clone()),
                jobs.clone(),
                Provisioner::new(fixture.compute.clone(), runner, clock.clone()),
                clock.clone(),
                Duration::from_secs(3600),
            );
            TestIntake {
                intake,
                upstream: fixture.upstream,
                compute: fixture.compute,
                jobs,
                profiles,
                clock,
            }
        }
    }

    impl TestIntake {
        pub fn upstream(&self) -> &FakeUpstream {
            self.upstream.as_deref().unwrap()
        }

        pub async fn deliver(&self, body: &serde_json::Value) -> Result<IntakeOutcome, IntakeError> {
            let body = serde_json::to_vec(body).unwrap();
            let signature = sign(SECRET.as_bytes(), &body);
            self.intake
                .handle(Delivery {
                    event: Some(WORKFLOW_JOB_EVENT),
                    signature: Some(&signature),
                    delivery_id: Some("delivery-1"),
                    body: &body,
                })
                .await
        }

        pub fn job(&self, job_id: &str) -> Option<JobRecord> {
            self.jobs.get_job(job_id).unwrap()
        }
    }

    fn ignored(result: Result<IntakeOutcome, IntakeError>) -> IgnoreReason {
        match result {
            Ok(IntakeOutcome::Ignored(reason)) => reason,
            other => panic!("Delivery should be ignored, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn provision_queued_job() {
        let test = FixtureBuilder::default()
            .compute(Arc::new(
                FakeCompute::new(FleetBehavior::Launch).with_spot_instance("i-abc", "c7i.large"),
            ))
            .build();
        let outcome = test
            .deliver(&queued_event(1001, &["self-hosted", "spotrunner/linux"]))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            IntakeOutcome::Provisioned(ProvisionedWorker {
                instance_id: "i-abc".to_string(),
                instance_type: "c7i.large".to_string(),
                spot: true,
            })
        );
        assert_eq!(test.upstream().token_requests(), vec![77]);
        let registrations = test.upstream().registrations();
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].repo_full_name, "octo/widgets");
        assert_eq!(registrations[0].runner_name, "linux-1001");
        assert_eq!(test.compute.fleet_requests().len(), 1);

        let record = test.job("1001").unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.instance_id.as_deref(), Some("i-abc"));
        assert_eq!(record.instance_type.as_deref(), Some("c7i.large"));
        assert_eq!(record.spot, Some(true));
        assert_eq!(record.profile_name, "linux");
        assert_eq!(record.workflow_name, "CI");
    }

    #[tokio::test]
    async fn response_body_of_provisioned_job() {
        let test = FixtureBuilder::default()
            .compute(Arc::new(
                FakeCompute::new(FleetBehavior::Launch).with_spot_instance("i-abc", "c7i.large"),
            ))
            .build();
        let response = test
            .deliver(&queued_event(1, &["spotrunner/linux"]))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body,
            json!({"instanceId": "i-abc", "instanceType": "c7i.large", "isSpot": true})
        );
    }

    #[tokio::test]
    async fn no_route_has_no_side_effects() {
        let test = FixtureBuilder::default().build();
        let reason = ignored(
            test.deliver(&queued_event(5, &["self-hosted", "linux", "x64"]))
                .await,
        );
        assert_eq!(reason, IgnoreReason::NoRoute);
        assert!(test.job("5").is_none());
        assert!(test.upstream().token_requests().is_empty());
        assert!(test.upstream().registrations().is_empty());
        assert_eq!(test.compute.call_count(), 0);
    }

    #[tokio::test]
    async fn unknown_profile_without_default() {
        let test = FixtureBuilder::default().build();
        let reason = ignored(test.deliver(&queued_event(5, &["spotrunner/gpu"])).await);
        assert_eq!(reason, IgnoreReason::NoConfiguration("gpu".to_string()));
        assert!(test.job("5").is_none());
    }

    #[tokio::test]
    async fn unknown_profile_uses_default() {
        let test = FixtureBuilder::default()
            .profiles(vec![test_profile("default")])
            .build();
        let outcome = test.deliver(&queued_event(5, &["spotrunner/gpu"])).await.unwrap();
        assert!(matches!(outcome, IntakeOutcome::Provisioned(_)));
        assert_eq!(test.job("5").unwrap().profile_name, "default");
    }

    #[tokio::test]
    async fn reject_invalid_signature() {
        let test = FixtureBuilder::default().build();
        let body = serde_json::to_vec(&queued_event(5, &["spotrunner/linux"])).unwrap();
        let mut signature = sign(SECRET.as_bytes(), &body);
        let flipped = if &signature[7..9] == "00" { "11" } else { "00" };
        signature.replace_range(7..9, flipped);

        for signature in [None, Some(signature.as_str()), Some("sha1=abc")] {
            let result = test
                .intake
                .handle(Delivery {
                    event: Some(WORKFLOW_JOB_EVENT),
                    signature,
                    delivery_id: None,
                    body: &body,
                })
                .await;
            let error = result.unwrap_err();
            assert_eq!(error.status_code(), StatusCode::UNAUTHORIZED);
        }
        assert!(test.job("5").is_none());
        assert!(test.upstream().token_requests().is_empty());
    }

    #[tokio::test]
    async fn missing_secret_or_credentials() {
        let test = FixtureBuilder::default().secret(None).build();
        let error = test
            .deliver(&queued_event(5, &["spotrunner/linux"]))
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let test = FixtureBuilder::default().upstream(None).build();
        let error = test
            .deliver(&queued_event(5, &["spotrunner/linux"]))
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(test.job("5").is_none());
    }

    #[tokio::test]
    async fn ignore_other_events_and_actions() {
        let test = FixtureBuilder::default().build();
        let body = b"{}".to_vec();
        let signature = sign(SECRET.as_bytes(), &body);
        let reason = ignored(
            test.intake
                .handle(Delivery {
                    event: Some("ping"),
                    signature: Some(&signature),
                    delivery_id: None,
                    body: &body,
                })
                .await,
        );
        assert_eq!(reason, IgnoreReason::OtherEvent("ping".to_string()));

        let mut event = queued_event(5, &["spotrunner/linux"]);
        event["action"] = json!("completed");
        let reason = ignored(test.deliver(&event).await);
        assert_eq!(reason, IgnoreReason::OtherAction("completed".to_string()));
        assert!(test.job("5").is_none());
    }

    #[tokio::test]
    async fn malformed_payload_is_acknowledged() {
        let test = FixtureBuilder::default().build();
        let reason = ignored(test.deliver(&json!({"action": "queued"})).await);
        assert_eq!(reason, IgnoreReason::MalformedPayload);
    }

    #[tokio::test]
    async fn invalid_profile_is_configuration_error() {
        let test = FixtureBuilder::default().build();
        test.profiles
            .put("broken", &json!({"instanceTypes": [], "imageId": "ami-1"}))
            .unwrap();
        let error = test
            .deliver(&queued_event(5, &["spotrunner/broken"]))
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(test.job("5").is_none());
    }

    #[tokio::test]
    async fn image_not_built_yet() {
        let mut profile = test_profile("linux");
        profile.image_id = Some(IMAGE_NOT_BUILT.to_string());
        let test = FixtureBuilder::default().profiles(vec![profile]).build();
        let reason = ignored(test.deliver(&queued_event(5, &["spotrunner/linux"])).await);
        assert_eq!(reason, IgnoreReason::ImageNotReady("linux".to_string()));
        assert!(test.job("5").is_none());
        assert_eq!(test.compute.call_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_noop() {
        let test = FixtureBuilder::default().build();
        let event = queued_event(5, &["spotrunner/linux"]);
        assert!(matches!(
            test.deliver(&event).await.unwrap(),
            IntakeOutcome::Provisioned(_)
        ));
        test.clock.advance(chrono::Duration::seconds(5));
        assert_eq!(
            ignored(test.deliver(&event).await),
            IgnoreReason::AlreadyClaimed
        );
        assert_eq!(test.upstream().token_requests().len(), 1);
        assert_eq!(test.compute.fleet_requests().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_deliveries_claim_once() {
        let test = FixtureBuilder::default().build();
        let event = queued_event(5, &["spotrunner/linux"]);
        let results = futures::future::join_all((0..4).map(|_| test.deliver(&event))).await;
        let provisioned = results
            .iter()
            .filter(|result| matches!(result, Ok(IntakeOutcome::Provisioned(_))))
            .count();
        assert_eq!(provisioned, 1);
        assert_eq!(test.upstream().registrations().len(), 1);
        assert_eq!(test.compute.fleet_requests().len(), 1);
    }

    #[tokio::test]
    async fn upstream_failure_marks_job_failed() {
        let test = FixtureBuilder::default()
            .upstream(Some(Arc::new(FakeUpstream::failing_registration(
                UpstreamError::Http {
                    status: 422,
                    message: "Runner group not found".to_string(),
                },
            ))))
            .build();
        let error = test
            .deliver(&queued_event(5, &["spotrunner/linux"]))
            .await
            .unwrap_err();
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let record = test.job("5").unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error_message.unwrap().contains("Runner group not found"));
        assert_eq!(test.compute.call_count(), 0);
    }

    #[tokio::test]
    async fn capacity_failure_marks_job_failed() {
        let mut profile = test_profile("linux");
        profile.spot_policy = SpotPolicy::SpotOnly;
        let test = FixtureBuilder::default()
            .profiles(vec![profile])
            .compute(Arc::new(FakeCompute::new(FleetBehavior::NoCapacity)))
            .build();
        let error = test
            .deliver(&queued_event(5, &["spotrunner/linux"]))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            IntakeError::Provision(ProvisionError::InsufficientCapacity(_))
        ));
        let record = test.job("5").unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.instance_id.is_none());
        assert!(test.compute.on_demand_requests().is_empty());
    }

    #[tokio::test]
    async fn error_response_hides_details() {
        let test = FixtureBuilder::default()
            .upstream(Some(Arc::new(FakeUpstream::failing_token(
                UpstreamError::Auth("bad key for app 1234".to_string()),
            ))))
            .build();
        let response = test
            .deliver(&queued_event(5, &["spotrunner/linux"]))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            r#"{"error":"Provisioning failed"}"#
        );
    }

    #[test]
    fn merge_registration_labels() {
        let mut profile = test_profile("linux");
        profile.labels = vec!["linux".to_string(), "Self-Hosted".to_string()];
        let labels = registration_labels(
            &["self-hosted".to_string(), "spotrunner/linux".to_string()],
            &profile,
        );
        assert_eq!(labels, vec!["self-hosted", "spotrunner/linux", "linux"]);
    }
}
