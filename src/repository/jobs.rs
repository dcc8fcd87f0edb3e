//! Job persistence and the claim queue.
//!
//! The jobs table doubles as the durable work queue: workers claim the
//! next due pending row inside a transaction, which yields at-least-once
//! execution with at-most-one concurrent attempt per job and no broker.
//! Retry scheduling is a `next_attempt_at` timestamp on the row.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::debug;
use uuid::Uuid;

use super::db::{Database, DieselError};
use super::diesel_models::{JobRecord, NewJob, NewPhiEntity, PhiEntityRecord};
use crate::models::{Job, JobStatus};
use crate::schema::{jobs, phi_entities};

/// Bootstrap DDL, run at startup so a fresh database is usable out of
/// the box. Kept in sync with `crate::schema`.
const BOOTSTRAP_SQL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        ocr_provider TEXT NOT NULL,
        phi_provider TEXT NOT NULL,
        masking_level TEXT NOT NULL,
        input_key TEXT NOT NULL,
        output_key TEXT,
        pages_processed INTEGER,
        phi_entities_masked INTEGER,
        processing_time_ms BIGINT,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        next_attempt_at TEXT,
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS phi_entities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        text TEXT NOT NULL,
        category TEXT NOT NULL,
        subcategory TEXT,
        page INTEGER NOT NULL,
        confidence DOUBLE NOT NULL,
        \"offset\" BIGINT NOT NULL,
        length BIGINT NOT NULL,
        bbox_x DOUBLE NOT NULL,
        bbox_y DOUBLE NOT NULL,
        bbox_width DOUBLE NOT NULL,
        bbox_height DOUBLE NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, next_attempt_at)",
    "CREATE INDEX IF NOT EXISTS idx_phi_entities_job ON phi_entities(job_id)",
];

/// A PHI entity row as persisted with a completed job.
#[derive(Debug, Clone)]
pub struct StoredPhiEntity {
    pub text: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub page: u32,
    pub confidence: f64,
    pub offset: usize,
    pub length: usize,
    pub bbox_x: f64,
    pub bbox_y: f64,
    pub bbox_width: f64,
    pub bbox_height: f64,
}

impl From<PhiEntityRecord> for StoredPhiEntity {
    fn from(record: PhiEntityRecord) -> Self {
        StoredPhiEntity {
            text: record.text,
            category: record.category,
            subcategory: record.subcategory,
            page: record.page.max(0) as u32,
            confidence: record.confidence,
            offset: record.offset.max(0) as usize,
            length: record.length.max(0) as usize,
            bbox_x: record.bbox_x,
            bbox_y: record.bbox_y,
            bbox_width: record.bbox_width,
            bbox_height: record.bbox_height,
        }
    }
}

/// Diesel-backed job repository.
#[derive(Clone)]
pub struct JobRepository {
    db: Database,
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create tables if they do not exist (SQLite bootstrap).
    pub async fn bootstrap(&self) -> Result<(), DieselError> {
        let mut conn = self.db.connect().await?;
        for statement in BOOTSTRAP_SQL {
            diesel::sql_query(*statement).execute(&mut conn).await?;
        }
        Ok(())
    }

    /// Insert a new pending job row.
    pub async fn create(&self, job: &Job) -> Result<(), DieselError> {
        let id = job.id.to_string();
        let created_at = job.created_at.to_rfc3339();
        let mut conn = self.db.connect().await?;
        diesel::insert_into(jobs::table)
            .values(NewJob {
                id: &id,
                status: job.status.as_str(),
                ocr_provider: &job.ocr_provider,
                phi_provider: &job.phi_provider,
                masking_level: job.masking_level.as_str(),
                input_key: &job.input_key,
                retry_count: job.retry_count as i32,
                created_at: &created_at,
            })
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Load a job by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Job>, DieselError> {
        let id = id.to_string();
        let mut conn = self.db.connect().await?;
        jobs::table
            .find(&id)
            .first::<JobRecord>(&mut conn)
            .await
            .optional()
            .map(|record| record.map(Job::from))
    }

    /// Most recently created jobs first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<Job>, DieselError> {
        let limit = limit as i64;
        let mut conn = self.db.connect().await?;
        jobs::table
            .order(jobs::created_at.desc())
            .limit(limit)
            .load::<JobRecord>(&mut conn)
            .await
            .map(|records| records.into_iter().map(Job::from).collect())
    }

    /// Atomically claim the next due pending job: transition it to
    /// `processing` and stamp `started_at`. Claiming and updating happen
    /// in one transaction so two workers can never hold the same job.
    pub async fn claim_due(&self) -> Result<Option<Job>, DieselError> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.db.connect().await?;
        conn.transaction(|conn| {
            let now = now.clone();
            Box::pin(async move {
                let record: Option<JobRecord> = jobs::table
                    .filter(jobs::status.eq(JobStatus::Pending.as_str()))
                    .filter(
                        jobs::next_attempt_at
                            .is_null()
                            .or(jobs::next_attempt_at.le(&now)),
                    )
                    .order(jobs::created_at.asc())
                    .limit(1)
                    .first(conn)
                    .await
                    .optional()?;

                let Some(record) = record else {
                    return Ok(None);
                };
                diesel::update(jobs::table.find(&record.id))
                    .set((
                        jobs::status.eq(JobStatus::Processing.as_str()),
                        jobs::started_at.eq(&now),
                        jobs::next_attempt_at.eq(None::<String>),
                    ))
                    .execute(conn)
                    .await?;

                let mut job = Job::from(record);
                job.status = JobStatus::Processing;
                job.started_at = Some(Utc::now());
                job.next_attempt_at = None;
                debug!(job_id = %job.id, attempt = job.retry_count, "claimed job");
                Ok(Some(job))
            })
        })
        .await
    }

    /// Re-queue `processing` rows whose worker apparently died: anything
    /// started longer ago than the hard time limit goes back to
    /// `pending`. This is the redelivery path; it is safe because PHI
    /// input is only deleted after the clean artifact is durably
    /// written, and output keys are deterministic so repeat uploads
    /// overwrite idempotently.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<usize, DieselError> {
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let mut conn = self.db.connect().await?;
        let updated = diesel::update(
            jobs::table
                .filter(jobs::status.eq(JobStatus::Processing.as_str()))
                .filter(jobs::started_at.le(&cutoff)),
        )
        .set(jobs::status.eq(JobStatus::Pending.as_str()))
        .execute(&mut conn)
        .await?;
        Ok(updated)
    }

    /// Schedule a retry: back to `pending` with a bumped retry count and
    /// an earliest-next-attempt timestamp.
    pub async fn schedule_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), DieselError> {
        let id = id.to_string();
        let next_attempt = next_attempt_at.to_rfc3339();
        let mut conn = self.db.connect().await?;
        diesel::update(jobs::table.find(&id))
            .set((
                jobs::status.eq(JobStatus::Pending.as_str()),
                jobs::retry_count.eq(retry_count as i32),
                jobs::next_attempt_at.eq(&next_attempt),
                jobs::error_message.eq(error_message),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Terminal failure: record the reason and close the job out.
    pub async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<(), DieselError> {
        let id = id.to_string();
        let now = Utc::now().to_rfc3339();
        let mut conn = self.db.connect().await?;
        diesel::update(jobs::table.find(&id))
            .set((
                jobs::status.eq(JobStatus::Failed.as_str()),
                jobs::error_message.eq(error_message),
                jobs::completed_at.eq(&now),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Completion: the COMPLETE transition and the per-entity rows are
    /// written in one transaction, so a crash can never leave a
    /// completed job without its entity records (or vice versa).
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_complete_with_entities(
        &self,
        id: Uuid,
        output_key: &str,
        pages_processed: u32,
        entities_masked: u32,
        processing_time_ms: u64,
        entities: Vec<StoredPhiEntity>,
    ) -> Result<(), DieselError> {
        let id = id.to_string();
        let output_key = output_key.to_string();
        let now = Utc::now().to_rfc3339();
        let mut conn = self.db.connect().await?;
        conn.transaction(|conn| {
            let id = id.clone();
            let output_key = output_key.clone();
            let now = now.clone();
            let entities = entities.clone();
            Box::pin(async move {
                diesel::update(jobs::table.find(&id))
                    .set((
                        jobs::status.eq(JobStatus::Complete.as_str()),
                        jobs::output_key.eq(&output_key),
                        jobs::pages_processed.eq(pages_processed as i32),
                        jobs::phi_entities_masked.eq(entities_masked as i32),
                        jobs::processing_time_ms.eq(processing_time_ms as i64),
                        jobs::completed_at.eq(&now),
                        jobs::error_message.eq(None::<String>),
                    ))
                    .execute(conn)
                    .await?;

                let rows: Vec<NewPhiEntity> = entities
                    .iter()
                    .map(|e| NewPhiEntity {
                        job_id: &id,
                        text: &e.text,
                        category: &e.category,
                        subcategory: e.subcategory.as_deref(),
                        page: e.page as i32,
                        confidence: e.confidence,
                        offset: e.offset as i64,
                        length: e.length as i64,
                        bbox_x: e.bbox_x,
                        bbox_y: e.bbox_y,
                        bbox_width: e.bbox_width,
                        bbox_height: e.bbox_height,
                    })
                    .collect();
                for row in &rows {
                    diesel::insert_into(phi_entities::table)
                        .values(row)
                        .execute(conn)
                        .await?;
                }
                Ok(())
            })
        })
        .await
    }

    /// Persisted entity rows for a job, in insertion order.
    pub async fn entities_for_job(&self, id: Uuid) -> Result<Vec<StoredPhiEntity>, DieselError> {
        let id = id.to_string();
        let mut conn = self.db.connect().await?;
        phi_entities::table
            .filter(phi_entities::job_id.eq(&id))
            .order(phi_entities::id.asc())
            .load::<PhiEntityRecord>(&mut conn)
            .await
            .map(|records| records.into_iter().map(StoredPhiEntity::from).collect())
    }

    /// Delete a job row; entity rows go with it via cascade.
    pub async fn delete(&self, id: Uuid) -> Result<bool, DieselError> {
        let id = id.to_string();
        let mut conn = self.db.connect().await?;
        let deleted = diesel::delete(jobs::table.find(&id))
            .execute(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MaskingLevel;
    use tempfile::tempdir;

    async fn test_repo(dir: &tempfile::TempDir) -> JobRepository {
        let db_path = dir.path().join("jobs.db");
        let repo = JobRepository::new(Database::new(&db_path.display().to_string()));
        repo.bootstrap().await.unwrap();
        repo
    }

    fn sample_job() -> Job {
        Job::new("mock", "mock", MaskingLevel::SafeHarbor, "input/a.tiff")
    }

    fn sample_entity() -> StoredPhiEntity {
        StoredPhiEntity {
            text: "John".to_string(),
            category: "Person".to_string(),
            subcategory: None,
            page: 1,
            confidence: 0.95,
            offset: 0,
            length: 4,
            bbox_x: 95.0,
            bbox_y: 195.0,
            bbox_width: 60.0,
            bbox_height: 30.0,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let dir = tempdir().unwrap();
        let repo = test_repo(&dir).await;
        let job = sample_job();
        repo.create(&job).await.unwrap();

        let loaded = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.input_key, "input/a.tiff");
        assert!(repo.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_transitions_to_processing() {
        let dir = tempdir().unwrap();
        let repo = test_repo(&dir).await;
        let job = sample_job();
        repo.create(&job).await.unwrap();

        let claimed = repo.claim_due().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(claimed.started_at.is_some());

        // The row is now processing: nothing left to claim.
        assert!(repo.claim_due().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scheduled_retry_defers_claim() {
        let dir = tempdir().unwrap();
        let repo = test_repo(&dir).await;
        let job = sample_job();
        repo.create(&job).await.unwrap();
        repo.claim_due().await.unwrap().unwrap();

        repo.schedule_retry(job.id, 1, Utc::now() + Duration::hours(1), "transient")
            .await
            .unwrap();
        assert!(repo.claim_due().await.unwrap().is_none());

        repo.schedule_retry(job.id, 1, Utc::now() - Duration::seconds(1), "transient")
            .await
            .unwrap();
        let claimed = repo.claim_due().await.unwrap().unwrap();
        assert_eq!(claimed.retry_count, 1);
    }

    #[tokio::test]
    async fn test_complete_writes_entities_in_same_transaction() {
        let dir = tempdir().unwrap();
        let repo = test_repo(&dir).await;
        let job = sample_job();
        repo.create(&job).await.unwrap();
        repo.claim_due().await.unwrap().unwrap();

        repo.mark_complete_with_entities(
            job.id,
            "masked/out.tiff",
            3,
            1,
            1234,
            vec![sample_entity()],
        )
        .await
        .unwrap();

        let loaded = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Complete);
        assert_eq!(loaded.output_key.as_deref(), Some("masked/out.tiff"));
        assert_eq!(loaded.pages_processed, Some(3));
        assert_eq!(loaded.phi_entities_masked, Some(1));
        assert!(loaded.completed_at.is_some());

        let entities = repo.entities_for_job(job.id).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].text, "John");
        assert_eq!(entities[0].bbox_x, 95.0);
    }

    #[tokio::test]
    async fn test_mark_failed_is_terminal() {
        let dir = tempdir().unwrap();
        let repo = test_repo(&dir).await;
        let job = sample_job();
        repo.create(&job).await.unwrap();
        repo.claim_due().await.unwrap().unwrap();

        repo.mark_failed(job.id, "exhausted retries").await.unwrap();
        let loaded = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("exhausted retries"));
        assert!(repo.claim_due().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_stale_recovers_dead_worker_rows() {
        let dir = tempdir().unwrap();
        let repo = test_repo(&dir).await;
        let job = sample_job();
        repo.create(&job).await.unwrap();
        repo.claim_due().await.unwrap().unwrap();

        // Nothing is stale yet with a generous limit.
        assert_eq!(repo.requeue_stale(Duration::hours(1)).await.unwrap(), 0);
        // With a zero limit the in-flight row counts as dead.
        assert_eq!(repo.requeue_stale(Duration::zero()).await.unwrap(), 1);
        assert!(repo.claim_due().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_cascades_entities() {
        let dir = tempdir().unwrap();
        let repo = test_repo(&dir).await;
        let job = sample_job();
        repo.create(&job).await.unwrap();
        repo.claim_due().await.unwrap().unwrap();
        repo.mark_complete_with_entities(job.id, "masked/x.tiff", 1, 1, 10, vec![sample_entity()])
            .await
            .unwrap();

        assert!(repo.delete(job.id).await.unwrap());
        assert!(repo.get(job.id).await.unwrap().is_none());
        assert!(repo.entities_for_job(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_recent_orders_newest_first() {
        let dir = tempdir().unwrap();
        let repo = test_repo(&dir).await;
        let first = sample_job();
        repo.create(&first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = sample_job();
        repo.create(&second).await.unwrap();

        let listed = repo.list_recent(10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
    }
}
