use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::timeutils::to_chrono;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Provisioning,
    Running,
    Completed,
    Failed,
    Timeout,
    Interrupted,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Provisioning,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Timeout,
        JobStatus::Interrupted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Provisioning => "provisioning",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout | JobStatus::Interrupted
        )
    }

    /// Transition table of the job lifecycle. Stores do not check it, components that change
    /// the status do.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Provisioning | Failed | Timeout)
                | (Provisioning, Running | Failed | Timeout)
                | (Running, Completed | Failed | Timeout | Interrupted)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| crate::Error::DeserializationError(format!("Unknown job status `{s}`")))
    }
}

/// Lifecycle record of a single job, keyed by the job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub instance_id: Option<String>,
    pub status: JobStatus,
    pub repo_full_name: String,
    pub workflow_name: String,
    pub labels: Vec<String>,
    pub profile_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Retention horizon (epoch seconds)
    pub expires_at: i64,
    pub error_message: Option<String>,
    pub instance_type: Option<String>,
    pub spot: Option<bool>,
}

impl JobRecord {
    pub fn new_pending(
        job_id: String,
        repo_full_name: String,
        workflow_name: String,
        labels: Vec<String>,
        profile_name: String,
        now: DateTime<Utc>,
        retention: std::time::Duration,
    ) -> Self {
        Self {
            job_id,
            instance_id: None,
            status: JobStatus::Pending,
            repo_full_name,
            workflow_name,
            labels,
            profile_name,
            created_at: now,
            updated_at: now,
            expires_at: (now + to_chrono(retention)).timestamp(),
            error_message: None,
            instance_type: None,
            spot: None,
        }
    }
}

/// Fields that are merged into an existing record. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRecordUpdate {
    pub status: Option<JobStatus>,
    pub instance_id: Option<String>,
    pub error_message: Option<String>,
    pub instance_type: Option<String>,
    pub spot: Option<bool>,
}

impl JobRecordUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_instance(mut self, instance_id: String, instance_type: String, spot: bool) -> Self {
        self.instance_id = Some(instance_id);
        self.instance_type = Some(instance_type);
        self.spot = Some(spot);
        self
    }

    pub fn apply(&self, record: &mut JobRecord, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(instance_id) = &self.instance_id {
            record.instance_id = Some(instance_id.clone());
        }
        if let Some(message) = &self.error_message {
            record.error_message = Some(message.clone());
        }
        if let Some(instance_type) = &self.instance_type {
            record.instance_type = Some(instance_type.clone());
        }
        if let Some(spot) = self.spot {
            record.spot = Some(spot);
        }
        record.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Building,
    Ready,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Building => "building",
            ImageStatus::Ready => "ready",
            ImageStatus::Failed => "failed",
        }
    }
}

impl Display for ImageStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(ImageStatus::Building),
            "ready" => Ok(ImageStatus::Ready),
            "failed" => Ok(ImageStatus::Failed),
            _ => Err(crate::Error::DeserializationError(format!(
                "Unknown image status `{s}`"
            ))),
        }
    }
}

/// Image readiness of a single profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStateRecord {
    pub profile_name: String,
    pub image_id: Option<String>,
    pub status: ImageStatus,
    pub updated_at: DateTime<Utc>,
    pub build_id: Option<String>,
    pub error_message: Option<String>,
}

impl ImageStateRecord {
    pub fn key(&self) -> String {
        image_key(&self.profile_name)
    }
}

pub fn image_key(profile_name: &str) -> String {
    format!("IMAGE#{profile_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn lifecycle_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Provisioning));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Timeout));
        assert!(!Pending.can_transition_to(Running));
        assert!(Provisioning.can_transition_to(Running));
        assert!(!Provisioning.can_transition_to(Completed));
        assert!(Running.can_transition_to(Interrupted));
        assert!(Running.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Failed, Timeout, Interrupted] {
            assert!(terminal.is_terminal());
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_names() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("stuck".parse::<JobStatus>().is_err());
        assert_eq!("ready".parse::<ImageStatus>().unwrap(), ImageStatus::Ready);
    }

    #[test]
    fn merge_update() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap();
        let mut record = JobRecord::new_pending(
            "1".to_string(),
            "org/repo".to_string(),
            "ci".to_string(),
            vec!["spotrunner/linux".to_string()],
            "linux".to_string(),
            now,
            std::time::Duration::from_secs(7 * 24 * 3600),
        );
        assert_eq!(record.expires_at, now.timestamp() + 7 * 24 * 3600);

        let later = now + chrono::Duration::seconds(30);
        JobRecordUpdate::status(JobStatus::Running)
            .with_instance("i-1".to_string(), "m7i.large".to_string(), true)
            .apply(&mut record, later);
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.instance_id.as_deref(), Some("i-1"));
        assert_eq!(record.spot, Some(true));
        assert_eq!(record.updated_at, later);
        assert_eq!(record.created_at, now);
        assert_eq!(record.error_message, None);
    }

    #[test]
    fn image_record_key() {
        assert_eq!(image_key("linux-x64"), "IMAGE#linux-x64");
    }
}
