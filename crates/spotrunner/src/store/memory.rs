use std::sync::{Mutex, MutexGuard};

use crate::Map;
use crate::common::clock::ClockRef;
use crate::store::records::{ImageStateRecord, JobRecord, JobRecordUpdate, JobStatus};
use crate::store::{ClaimOutcome, ImageStateStore, LifecycleStore};

/// Store that keeps all records in memory. Every operation takes a single lock, which makes
/// the conditional writes atomic.
pub struct MemoryStore {
    clock: ClockRef,
    jobs: Mutex<Map<String, JobRecord>>,
    images: Mutex<Map<String, ImageStateRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryStore {
    pub fn new(clock: ClockRef) -> Self {
        Self {
            clock,
            jobs: Default::default(),
            images: Default::default(),
        }
    }
}

impl LifecycleStore for MemoryStore {
    fn create_job(&self, record: &JobRecord) -> crate::Result<ClaimOutcome> {
        let mut jobs = lock(&self.jobs);
        if jobs.contains_key(&record.job_id) {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        jobs.insert(record.job_id.clone(), record.clone());
        Ok(ClaimOutcome::Claimed)
    }

    fn get_job(&self, job_id: &str) -> crate::Result<Option<JobRecord>> {
        Ok(lock(&self.jobs).get(job_id).cloned())
    }

    fn update_job(&self, job_id: &str, update: &JobRecordUpdate) -> crate::Result<Option<JobRecord>> {
        let mut jobs = lock(&self.jobs);
        Ok(jobs.get_mut(job_id).map(|record| {
            update.apply(record, self.clock.now());
            record.clone()
        }))
    }

    fn jobs_with_status(&self, status: JobStatus) -> crate::Result<Vec<JobRecord>> {
        let mut records: Vec<JobRecord> = lock(&self.jobs)
            .values()
            .filter(|record| record.status == status)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    fn delete_job(&self, job_id: &str) -> crate::Result<bool> {
        Ok(lock(&self.jobs).remove(job_id).is_some())
    }

    fn purge_expired(&self, now: i64) -> crate::Result<usize> {
        let mut jobs = lock(&self.jobs);
        let before = jobs.len();
        jobs.retain(|_, record| record.expires_at >= now);
        Ok(before - jobs.len())
    }
}

impl ImageStateStore for MemoryStore {
    fn get_image(&self, profile_name: &str) -> crate::Result<Option<ImageStateRecord>> {
        Ok(lock(&self.images).get(profile_name).cloned())
    }

    fn list_images(&self) -> crate::Result<Vec<ImageStateRecord>> {
        let mut records: Vec<ImageStateRecord> = lock(&self.images).values().cloned().collect();
        records.sort_by(|a, b| a.profile_name.cmp(&b.profile_name));
        Ok(records)
    }

    fn put_image_if_newer(&self, record: &ImageStateRecord) -> crate::Result<bool> {
        let mut images = lock(&self.images);
        if let Some(stored) = images.get(&record.profile_name) {
            if stored.updated_at >= record.updated_at {
                return Ok(false);
            }
        }
        images.insert(record.profile_name.clone(), record.clone());
        Ok(true)
    }
}
