//! Record stores shared by all units of work.
//!
//! Stores offer conditional writes as their only concurrency control: a job record is created
//! at most once and an image record is only replaced by a strictly newer one. Neither store
//! knows anything about the lifecycle transition table.
pub mod memory;
pub mod records;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use crate::common::clock::ClockRef;
use crate::store::memory::MemoryStore;
use crate::store::records::{ImageStateRecord, JobRecord, JobRecordUpdate, JobStatus};
use crate::store::sqlite::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// A record with the same job id exists already.
    AlreadyClaimed,
}

pub trait LifecycleStore: Send + Sync {
    /// Creates the record if there is no record with the same job id.
    fn create_job(&self, record: &JobRecord) -> crate::Result<ClaimOutcome>;

    fn get_job(&self, job_id: &str) -> crate::Result<Option<JobRecord>>;

    /// Merges `update` into an existing record and refreshes its `updated_at`.
    /// Returns the updated record or `None` if the record does not exist.
    fn update_job(&self, job_id: &str, update: &JobRecordUpdate) -> crate::Result<Option<JobRecord>>;

    fn jobs_with_status(&self, status: JobStatus) -> crate::Result<Vec<JobRecord>>;

    fn delete_job(&self, job_id: &str) -> crate::Result<bool>;

    /// Removes records whose retention horizon is older than `now` (epoch seconds).
    fn purge_expired(&self, now: i64) -> crate::Result<usize>;
}

pub trait ImageStateStore: Send + Sync {
    fn get_image(&self, profile_name: &str) -> crate::Result<Option<ImageStateRecord>>;

    fn list_images(&self) -> crate::Result<Vec<ImageStateRecord>>;

    /// Writes the record if there is no record for its profile or if the stored record is
    /// strictly older. Returns false when the write was rejected.
    fn put_image_if_newer(&self, record: &ImageStateRecord) -> crate::Result<bool>;
}

pub type LifecycleStoreRef = Arc<dyn LifecycleStore>;
pub type ImageStateStoreRef = Arc<dyn ImageStateStore>;

/// Opens the SQLite store at `path`, or an in-memory store when no path is configured.
pub fn open_stores(
    path: Option<&Path>,
    clock: ClockRef,
) -> crate::Result<(LifecycleStoreRef, ImageStateStoreRef)> {
    match path {
        Some(path) => {
            let store = Arc::new(SqliteStore::open(path, clock)?);
            Ok((store.clone(), store))
        }
        None => {
            log::warn!("No database configured, records are kept in memory only");
            let store = Arc::new(MemoryStore::new(clock));
            Ok((store.clone(), store))
        }
    }
}
