//! Machine image build pipeline. Pipelines are black boxes that produce versioned images, the
//! system only reads which builds exist and what they produced.
pub mod imagebuilder;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

pub type BuildResult<T> = anyhow::Result<T>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
    /// States that say nothing about the outcome of the build (e.g. deprecated images).
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildInfo {
    pub build_id: String,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    pub reason: Option<String>,
}

pub trait BuildPipelineHandler: Send + Sync {
    /// Returns the identifier of the pipeline with the given name.
    fn find_pipeline<'a>(&'a self, name: &'a str) -> BoxFuture<'a, BuildResult<Option<String>>>;

    fn list_builds<'a>(&'a self, pipeline_id: &'a str) -> BoxFuture<'a, BuildResult<Vec<BuildInfo>>>;

    /// Returns the image produced by a successful build, preferring the image of the
    /// configured region.
    fn build_image<'a>(&'a self, build_id: &'a str) -> BoxFuture<'a, BuildResult<Option<String>>>;
}

pub type BuildPipelineHandlerRef = Arc<dyn BuildPipelineHandler>;

/// Newest build by creation time.
pub fn newest_build(builds: &[BuildInfo]) -> Option<&BuildInfo> {
    builds.iter().max_by_key(|build| build.created_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn pick_newest_build() {
        let build = |id: &str, hour: u32| BuildInfo {
            build_id: id.to_string(),
            status: BuildStatus::Succeeded,
            created_at: Utc.with_ymd_and_hms(2026, 10, 19, hour, 0, 0).unwrap(),
            reason: None,
        };
        let builds = vec![build("b1", 8), build("b3", 10), build("b2", 9)];
        assert_eq!(newest_build(&builds).unwrap().build_id, "b3");
        assert_eq!(newest_build(&[]), None);
    }
}
