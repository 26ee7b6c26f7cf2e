//! SQLite backed store.
//!
//! Conditional writes are expressed as single statements (`ON CONFLICT DO NOTHING` for job
//! claims and a guarded `ON CONFLICT DO UPDATE` for image records), so they stay atomic even
//! when several processes share the database file.
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::common::clock::ClockRef;
use crate::common::timeutils::{format_timestamp, parse_timestamp};
use crate::store::records::{ImageStateRecord, JobRecord, JobRecordUpdate, JobStatus};
use crate::store::{ClaimOutcome, ImageStateStore, LifecycleStore};

const JOB_COLUMNS: &str = "job_id, instance_id, status, repo_full_name, workflow_name, labels, \
    profile_name, created_at, updated_at, expires_at, error_message, instance_type, spot";

const IMAGE_COLUMNS: &str = "profile_name, image_id, status, updated_at, build_id, error_message";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    clock: ClockRef,
}

/// Raw column values of a job row.
struct JobRow {
    job_id: String,
    instance_id: Option<String>,
    status: String,
    repo_full_name: String,
    workflow_name: String,
    labels: String,
    profile_name: String,
    created_at: String,
    updated_at: String,
    expires_at: i64,
    error_message: Option<String>,
    instance_type: Option<String>,
    spot: Option<bool>,
}

impl JobRow {
    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            instance_id: row.get(1)?,
            status: row.get(2)?,
            repo_full_name: row.get(3)?,
            workflow_name: row.get(4)?,
            labels: row.get(5)?,
            profile_name: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            expires_at: row.get(9)?,
            error_message: row.get(10)?,
            instance_type: row.get(11)?,
            spot: row.get(12)?,
        })
    }

    fn into_record(self) -> crate::Result<JobRecord> {
        Ok(JobRecord {
            job_id: self.job_id,
            instance_id: self.instance_id,
            status: self.status.parse()?,
            repo_full_name: self.repo_full_name,
            workflow_name: self.workflow_name,
            labels: serde_json::from_str(&self.labels)?,
            profile_name: self.profile_name,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            expires_at: self.expires_at,
            error_message: self.error_message,
            instance_type: self.instance_type,
            spot: self.spot,
        })
    }
}

struct ImageRow {
    profile_name: String,
    image_id: Option<String>,
    status: String,
    updated_at: String,
    build_id: Option<String>,
    error_message: Option<String>,
}

impl ImageRow {
    fn read(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            profile_name: row.get(0)?,
            image_id: row.get(1)?,
            status: row.get(2)?,
            updated_at: row.get(3)?,
            build_id: row.get(4)?,
            error_message: row.get(5)?,
        })
    }

    fn into_record(self) -> crate::Result<ImageStateRecord> {
        Ok(ImageStateRecord {
            profile_name: self.profile_name,
            image_id: self.image_id,
            status: self.status.parse()?,
            updated_at: parse_timestamp(&self.updated_at)?,
            build_id: self.build_id,
            error_message: self.error_message,
        })
    }
}

impl SqliteStore {
    pub fn open(path: &Path, clock: ClockRef) -> crate::Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            crate::Error::StoreError(format!("Cannot open database {}: {e}", path.display()))
        })?;
        Self::from_connection(conn, clock)
    }

    pub fn open_in_memory(clock: ClockRef) -> crate::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, clock)
    }

    fn from_connection(conn: Connection, clock: ClockRef) -> crate::Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_schema(&self) -> crate::Result<()> {
        self.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
              job_id TEXT PRIMARY KEY,
              instance_id TEXT,
              status TEXT NOT NULL,
              repo_full_name TEXT NOT NULL,
              workflow_name TEXT NOT NULL,
              labels TEXT NOT NULL,
              profile_name TEXT NOT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              expires_at INTEGER NOT NULL,
              error_message TEXT,
              instance_type TEXT,
              spot INTEGER
            );
            CREATE INDEX IF NOT EXISTS jobs_by_status ON jobs (status);
            CREATE TABLE IF NOT EXISTS image_states (
              key TEXT PRIMARY KEY,
              profile_name TEXT NOT NULL,
              image_id TEXT,
              status TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              build_id TEXT,
              error_message TEXT
            );
            "#,
        )?;
        Ok(())
    }

    fn read_job(conn: &Connection, job_id: &str) -> crate::Result<Option<JobRecord>> {
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1"),
                params![job_id],
                JobRow::read,
            )
            .optional()?;
        row.map(JobRow::into_record).transpose()
    }
}

impl LifecycleStore for SqliteStore {
    fn create_job(&self, record: &JobRecord) -> crate::Result<ClaimOutcome> {
        let labels = serde_json::to_string(&record.labels)?;
        let inserted = self.lock().execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT (job_id) DO NOTHING"
            ),
            params![
                record.job_id,
                record.instance_id,
                record.status.as_str(),
                record.repo_full_name,
                record.workflow_name,
                labels,
                record.profile_name,
                format_timestamp(&record.created_at),
                format_timestamp(&record.updated_at),
                record.expires_at,
                record.error_message,
                record.instance_type,
                record.spot,
            ],
        )?;
        Ok(if inserted == 1 {
            ClaimOutcome::Claimed
        } else {
            ClaimOutcome::AlreadyClaimed
        })
    }

    fn get_job(&self, job_id: &str) -> crate::Result<Option<JobRecord>> {
        Self::read_job(&self.lock(), job_id)
    }

    fn update_job(&self, job_id: &str, update: &JobRecordUpdate) -> crate::Result<Option<JobRecord>> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE jobs SET
               status = COALESCE(?2, status),
               instance_id = COALESCE(?3, instance_id),
               error_message = COALESCE(?4, error_message),
               instance_type = COALESCE(?5, instance_type),
               spot = COALESCE(?6, spot),
               updated_at = ?7
             WHERE job_id = ?1",
            params![
                job_id,
                update.status.map(|s| s.as_str()),
                update.instance_id,
                update.error_message,
                update.instance_type,
                update.spot,
                format_timestamp(&self.clock.now()),
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Self::read_job(&conn, job_id)
    }

    fn jobs_with_status(&self, status: JobStatus) -> crate::Result<Vec<JobRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map(params![status.as_str()], JobRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(JobRow::into_record).collect()
    }

    fn delete_job(&self, job_id: &str) -> crate::Result<bool> {
        let deleted = self
            .lock()
            .execute("DELETE FROM jobs WHERE job_id = ?1", params![job_id])?;
        Ok(deleted > 0)
    }

    fn purge_expired(&self, now: i64) -> crate::Result<usize> {
        let deleted = self
            .lock()
            .execute("DELETE FROM jobs WHERE expires_at < ?1", params![now])?;
        Ok(deleted)
    }
}

impl ImageStateStore for SqliteStore {
    fn get_image(&self, profile_name: &str) -> crate::Result<Option<ImageStateRecord>> {
        let row = self
            .lock()
            .query_row(
                &format!("SELECT {IMAGE_COLUMNS} FROM image_states WHERE key = ?1"),
                params![crate::store::records::image_key(profile_name)],
                ImageRow::read,
            )
            .optional()?;
        row.map(ImageRow::into_record).transpose()
    }

    fn list_images(&self) -> crate::Result<Vec<ImageStateRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {IMAGE_COLUMNS} FROM image_states ORDER BY profile_name"
        ))?;
        let rows = stmt
            .query_map([], ImageRow::read)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(ImageRow::into_record).collect()
    }

    fn put_image_if_newer(&self, record: &ImageStateRecord) -> crate::Result<bool> {
        let changed = self.lock().execute(
            &format!(
                "INSERT INTO image_states (key, {IMAGE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (key) DO UPDATE SET
                   profile_name = excluded.profile_name,
                   image_id = excluded.image_id,
                   status = excluded.status,
                   updated_at = excluded.updated_at,
                   build_id = excluded.build_id,
                   error_message = excluded.error_message
                 WHERE excluded.updated_at > image_states.updated_at"
            ),
            params![
                record.key(),
                record.profile_name,
                record.image_id,
                record.status.as_str(),
                format_timestamp(&record.updated_at),
                record.build_id,
                record.error_message,
            ],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::clock::{Clock, ManualClock};
    use crate::store::conformance;
    use tempfile::TempDir;

    #[test]
    fn job_records() {
        let clock = Arc::new(ManualClock::new(conformance::start()));
        let store = SqliteStore::open_in_memory(clock.clone()).unwrap();
        conformance::check_job_records(&store, &clock);
    }

    #[test]
    fn image_records() {
        let clock = Arc::new(ManualClock::new(conformance::start()));
        conformance::check_image_records(&SqliteStore::open_in_memory(clock).unwrap());
    }

    #[test]
    fn at_most_one_claim() {
        let clock = Arc::new(ManualClock::new(conformance::start()));
        conformance::check_concurrent_claims(Arc::new(SqliteStore::open_in_memory(clock).unwrap()));
    }

    #[test]
    fn monotonic_image_writes() {
        let clock = Arc::new(ManualClock::new(conformance::start()));
        conformance::check_concurrent_image_writes(Arc::new(
            SqliteStore::open_in_memory(clock).unwrap(),
        ));
    }

    #[test]
    fn claims_across_connections() {
        let dir = TempDir::with_prefix("store").unwrap();
        let path = dir.path().join("spotrunner.db");
        let clock = Arc::new(ManualClock::new(conformance::start()));
        let first = SqliteStore::open(&path, clock.clone()).unwrap();
        let second = SqliteStore::open(&path, clock.clone()).unwrap();

        let record = conformance::job("7", clock.now());
        assert_eq!(first.create_job(&record).unwrap(), ClaimOutcome::Claimed);
        assert_eq!(second.create_job(&record).unwrap(), ClaimOutcome::AlreadyClaimed);
        assert_eq!(second.get_job("7").unwrap(), Some(record));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = TempDir::with_prefix("store").unwrap();
        let path = dir.path().join("spotrunner.db");
        let clock = Arc::new(ManualClock::new(conformance::start()));
        {
            let store = SqliteStore::open(&path, clock.clone()).unwrap();
            store
                .put_image_if_newer(&conformance::image(
                    "linux",
                    crate::store::records::ImageStatus::Ready,
                    Some("ami-1"),
                    clock.now(),
                ))
                .unwrap();
        }
        let store = SqliteStore::open(&path, clock).unwrap();
        assert_eq!(
            store.get_image("linux").unwrap().unwrap().image_id.as_deref(),
            Some("ami-1")
        );
    }
}
