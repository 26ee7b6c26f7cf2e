//! Read-only health summary of the whole system.
//!
//! The summary never contains job, repository or credential data. Upstream failures are
//! reduced to a category and a fixed message.
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::clock::ClockRef;
use crate::common::memo::Memo;
use crate::reconcile::images::ImageReconciler;
use crate::reconcile::log_image_report;
use crate::store::ImageStateStoreRef;
use crate::store::records::{ImageStateRecord, ImageStatus};
use crate::upstream::github::categorize;
use crate::upstream::{Connectivity, UpstreamClientRef, UpstreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Ready,
    Building,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileStatus {
    pub name: String,
    pub status: ImageStatus,
    pub image_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GithubState {
    Connected,
    AuthenticationError,
    Unreachable,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubStatus {
    pub status: GithubState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_slug: Option<String>,
}

impl From<Connectivity> for GithubStatus {
    fn from(connectivity: Connectivity) -> Self {
        let (status, message, app_slug) = match connectivity {
            Connectivity::Connected { app_slug } => (
                GithubState::Connected,
                "Connected to GitHub".to_string(),
                app_slug,
            ),
            Connectivity::AuthenticationError(message) => {
                (GithubState::AuthenticationError, message, None)
            }
            Connectivity::Unreachable(message) => (GithubState::Unreachable, message, None),
            Connectivity::UnexpectedError(message) => (GithubState::Error, message, None),
        };
        Self {
            status,
            message,
            app_slug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub status: OverallStatus,
    pub message: String,
    pub profiles: Vec<ProfileStatus>,
    pub github: GithubStatus,
}

/// Combines image readiness of every profile with upstream connectivity.
pub fn summarize(images: &[ImageStateRecord], connectivity: Connectivity) -> SystemStatus {
    let connected = connectivity.is_connected();
    let mut problems = vec![];
    let mut building = 0;
    for record in images {
        match (record.status, &record.image_id) {
            (ImageStatus::Ready, Some(_)) => {}
            (ImageStatus::Ready, None) => {
                problems.push(format!("Profile `{}` has no image", record.profile_name));
            }
            (ImageStatus::Building, _) => building += 1,
            (ImageStatus::Failed, _) => {
                problems.push(format!("Image build of `{}` failed", record.profile_name));
            }
        }
    }
    if images.is_empty() {
        problems.push("No profiles are deployed".to_string());
    }
    if !connected {
        problems.push("GitHub is not reachable with the app credentials".to_string());
    }

    let (status, message) = if !problems.is_empty() {
        (OverallStatus::Degraded, problems.join("; "))
    } else if building > 0 {
        (
            OverallStatus::Building,
            format!("{building} image(s) are being built"),
        )
    } else {
        (OverallStatus::Ready, "All systems operational".to_string())
    };

    SystemStatus {
        status,
        message,
        profiles: images
            .iter()
            .map(|record| ProfileStatus {
                name: record.profile_name.clone(),
                status: record.status,
                image_id: record.image_id.clone(),
                updated_at: record.updated_at,
            })
            .collect(),
        github: connectivity.into(),
    }
}

pub struct StatusAggregator {
    images: ImageStateStoreRef,
    upstream: Option<UpstreamClientRef>,
    reconciler: Option<Arc<ImageReconciler>>,
    connectivity: Memo<Connectivity>,
    reconciled: Memo<()>,
}

impl StatusAggregator {
    pub fn new(
        images: ImageStateStoreRef,
        upstream: Option<UpstreamClientRef>,
        reconciler: Option<Arc<ImageReconciler>>,
        clock: ClockRef,
        connectivity_ttl: Option<Duration>,
        reconcile_ttl: Option<Duration>,
    ) -> Self {
        Self {
            images,
            upstream,
            reconciler,
            connectivity: Memo::new(clock.clone(), connectivity_ttl),
            reconciled: Memo::new(clock, reconcile_ttl),
        }
    }

    /// Only successful checks are remembered, failures are checked again on the next call.
    async fn connectivity(&self) -> Connectivity {
        let Some(upstream) = &self.upstream else {
            return categorize(Err(UpstreamError::NotConfigured));
        };
        self.connectivity
            .try_get_or_refresh(|| async {
                let connectivity = upstream.check_connectivity().await;
                if connectivity.is_connected() {
                    Ok(connectivity)
                } else {
                    Err(connectivity)
                }
            })
            .await
            .unwrap_or_else(|connectivity| connectivity)
    }

    async fn reconcile_images(&self) {
        let Some(reconciler) = &self.reconciler else {
            return;
        };
        self.reconciled
            .get_or_refresh(|| async {
                match reconciler.reconcile().await {
                    Ok(report) => log_image_report(&report),
                    Err(error) => log::warn!("Image reconciliation failed: {error}"),
                }
            })
            .await;
    }

    pub async fn status(&self) -> crate::Result<SystemStatus> {
        self.reconcile_images().await;
        let images = self.images.list_images()?;
        let connectivity = self.connectivity().await;
        Ok(summarize(&images, connectivity))
    }
}
