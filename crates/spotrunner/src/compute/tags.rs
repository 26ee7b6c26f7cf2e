//! Tags that identify workers and the jobs they run.
use chrono::{DateTime, Utc};

use crate::common::timeutils::format_timestamp;
use crate::router::profile::SpotPolicy;

pub const TAG_NAME: &str = "Name";
pub const TAG_JOB_ID: &str = "spotrunner:job-id";
pub const TAG_REPOSITORY: &str = "spotrunner:repository";
pub const TAG_WORKFLOW: &str = "spotrunner:workflow";
pub const TAG_LABELS: &str = "spotrunner:labels";
pub const TAG_PROFILE: &str = "spotrunner:profile";
pub const TAG_SPOT_POLICY: &str = "spotrunner:spot-policy";
pub const TAG_PROVISIONED_AT: &str = "spotrunner:provisioned-at";

/// Upper limit of tag values enforced by the provider.
const MAX_TAG_VALUE_LENGTH: usize = 256;

pub struct WorkerTags<'a> {
    pub job_id: &'a str,
    pub repository: &'a str,
    pub workflow: &'a str,
    pub labels: &'a [String],
    pub profile: &'a str,
    pub policy: SpotPolicy,
    pub provisioned_at: DateTime<Utc>,
}

fn truncate(value: &str) -> String {
    if value.len() <= MAX_TAG_VALUE_LENGTH {
        return value.to_string();
    }
    let mut end = MAX_TAG_VALUE_LENGTH;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

impl WorkerTags<'_> {
    pub fn to_tags(&self) -> Vec<(String, String)> {
        [
            (TAG_NAME, format!("spotrunner-{}-{}", self.profile, self.job_id)),
            (TAG_JOB_ID, self.job_id.to_string()),
            (TAG_REPOSITORY, self.repository.to_string()),
            (TAG_WORKFLOW, self.workflow.to_string()),
            (TAG_LABELS, self.labels.join(",")),
            (TAG_PROFILE, self.profile.to_string()),
            (TAG_SPOT_POLICY, self.policy.to_string()),
            (TAG_PROVISIONED_AT, format_timestamp(&self.provisioned_at)),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), truncate(&value)))
        .collect()
    }
}
