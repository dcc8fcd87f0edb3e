//! Durable job execution.
//!
//! A worker claims one job at a time from the repository's queue, runs
//! the pipeline, and finishes the two-bucket dance: the masked artifact
//! is uploaded to the clean bucket before the PHI input is deleted, and
//! the COMPLETE transition commits together with the per-entity rows.
//! The runner is the single place errors are classified into retry vs
//! fail.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::document::{DocumentError, DocumentProcessor};
use crate::masking::ImageMasker;
use crate::matching::EntityMatcher;
use crate::models::{DeidentificationResult, Job, MatchedEntity};
use crate::ocr::{self, OcrError, OcrProvider};
use crate::phi::{self, PhiDetectError, PhiDetector};
use crate::pipeline::{DeidentificationPipeline, PipelineError};
use crate::repository::{DieselError, JobRepository, StoredPhiEntity};
use crate::storage::{BucketPair, StorageError};

/// Errors from one job attempt.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("database error: {0}")]
    Database(#[from] DieselError),

    #[error("job timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider not registered: {0}")]
    UnknownProvider(String),
}

/// Recovery policy for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; re-queue with backoff while retries remain.
    Retryable,
    /// Auth/quota failures get exactly one retry; they rarely self-heal.
    RetryOnce,
    /// Deterministic; retrying cannot help.
    Terminal,
}

/// Classify an attempt error. This is the single classification point:
/// adapters and stages report what happened, only the runner decides
/// what it means for the job.
pub fn classify(error: &JobError) -> ErrorClass {
    match error {
        JobError::Pipeline(PipelineError::Document(e)) => match e {
            // Malformed input never becomes readable.
            DocumentError::Format(_) | DocumentError::Unsupported(_) => ErrorClass::Terminal,
            DocumentError::ToolNotFound(_) => ErrorClass::Terminal,
            DocumentError::Encode(_) | DocumentError::Io(_) => ErrorClass::Retryable,
        },
        JobError::Pipeline(PipelineError::Ocr(e)) => match e {
            OcrError::Transport(_) | OcrError::Provider(_) => ErrorClass::Retryable,
            OcrError::Auth(_) | OcrError::Quota(_) => ErrorClass::RetryOnce,
            OcrError::Decode(_) | OcrError::UnknownProvider(_) => ErrorClass::Terminal,
        },
        JobError::Pipeline(PipelineError::Phi(e)) => match e {
            PhiDetectError::Transport(_) | PhiDetectError::Provider(_) => ErrorClass::Retryable,
            PhiDetectError::Auth(_) | PhiDetectError::Quota(_) => ErrorClass::RetryOnce,
            PhiDetectError::Decode(_) | PhiDetectError::UnknownProvider(_) => {
                ErrorClass::Terminal
            }
        },
        JobError::Storage(e) => {
            if e.is_retryable() {
                ErrorClass::Retryable
            } else {
                // NotFound on input means the caller lost the file.
                ErrorClass::Terminal
            }
        }
        JobError::Database(_) => ErrorClass::Retryable,
        JobError::Timeout(_) => ErrorClass::Terminal,
        JobError::UnknownProvider(_) => ErrorClass::Terminal,
    }
}

/// Named provider instances a runner can execute jobs against.
///
/// Jobs carry provider names; the registry resolves them to live
/// adapters. Tests register hand-built mocks here.
#[derive(Default)]
pub struct ProviderRegistry {
    ocr: HashMap<String, Arc<dyn OcrProvider>>,
    phi: HashMap<String, Arc<dyn PhiDetector>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the providers configuration selected.
    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        registry.register_ocr(
            &settings.ocr_provider,
            ocr::provider_for(&settings.ocr_provider, settings).await?,
        );
        registry.register_phi(
            &settings.phi_provider,
            phi::detector_for(&settings.phi_provider, settings).await?,
        );
        Ok(registry)
    }

    pub fn register_ocr(&mut self, name: &str, provider: Arc<dyn OcrProvider>) {
        self.ocr.insert(name.to_string(), provider);
    }

    pub fn register_phi(&mut self, name: &str, detector: Arc<dyn PhiDetector>) {
        self.phi.insert(name.to_string(), detector);
    }

    fn ocr(&self, name: &str) -> Result<Arc<dyn OcrProvider>, JobError> {
        self.ocr
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::UnknownProvider(format!("ocr:{name}")))
    }

    fn phi(&self, name: &str) -> Result<Arc<dyn PhiDetector>, JobError> {
        self.phi
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::UnknownProvider(format!("phi:{name}")))
    }
}

/// Worker that drains the job queue.
pub struct JobRunner {
    repository: JobRepository,
    buckets: BucketPair,
    registry: ProviderRegistry,
    settings: Settings,
}

impl JobRunner {
    pub fn new(
        repository: JobRepository,
        buckets: BucketPair,
        registry: ProviderRegistry,
        settings: Settings,
    ) -> Self {
        Self {
            repository,
            buckets,
            registry,
            settings,
        }
    }

    /// Claim and execute jobs until the task is aborted. One job at a
    /// time per worker; stale `processing` rows from dead workers are
    /// re-queued as we go.
    pub async fn run(&self) -> Result<(), DieselError> {
        info!(
            poll_interval = ?self.settings.worker_poll_interval,
            "worker started"
        );
        loop {
            let stale_cutoff =
                chrono::Duration::from_std(self.settings.task_time_limit * 2).unwrap_or_default();
            let requeued = self.repository.requeue_stale(stale_cutoff).await?;
            if requeued > 0 {
                warn!(requeued, "re-queued stale processing jobs");
            }

            match self.run_once().await? {
                Some(_) => {}
                None => tokio::time::sleep(self.settings.worker_poll_interval).await,
            }
        }
    }

    /// Claim and execute at most one job. Returns the executed job id,
    /// or None when the queue was empty.
    pub async fn run_once(&self) -> Result<Option<Uuid>, DieselError> {
        let Some(job) = self.repository.claim_due().await? else {
            return Ok(None);
        };
        let id = job.id;
        self.execute(job).await;
        Ok(Some(id))
    }

    /// Run one attempt of a claimed job and persist the outcome. All
    /// failures are absorbed into the job row; nothing propagates.
    async fn execute(&self, job: Job) {
        let attempt = job.retry_count + 1;
        info!(job_id = %job.id, attempt, "starting job");

        let outcome = match tokio::time::timeout(self.settings.task_time_limit, self.attempt(&job))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::Timeout(self.settings.task_time_limit)),
        };

        let error = match outcome {
            Ok(()) => return,
            Err(error) => error,
        };

        let class = classify(&error);
        let bumped = job.retry_count + 1;
        let retries_left = match class {
            ErrorClass::Terminal => false,
            ErrorClass::RetryOnce => job.retry_count == 0,
            ErrorClass::Retryable => bumped < self.settings.max_retries,
        };

        if retries_left {
            let delay = self.backoff_delay(bumped);
            let next_attempt_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            warn!(
                job_id = %job.id,
                attempt,
                ?delay,
                error = %error,
                "job attempt failed; scheduling retry"
            );
            if let Err(db) = self
                .repository
                .schedule_retry(job.id, bumped, next_attempt_at, &error.to_string())
                .await
            {
                error!(job_id = %job.id, "failed to schedule retry: {db}");
            }
        } else {
            error!(job_id = %job.id, attempt, error = %error, "job failed terminally");
            if let Err(db) = self
                .repository
                .mark_failed(job.id, &error.to_string())
                .await
            {
                error!(job_id = %job.id, "failed to record job failure: {db}");
            }
        }
    }

    /// One attempt: download PHI input, run the pipeline under the soft
    /// time limit, upload the clean artifact, delete the PHI input, and
    /// commit COMPLETE with the entity rows.
    async fn attempt(&self, job: &Job) -> Result<(), JobError> {
        let ocr = self.registry.ocr(&job.ocr_provider)?;
        let phi = self.registry.phi(&job.phi_provider)?;
        let pipeline = DeidentificationPipeline::new(
            DocumentProcessor::new(self.settings.streaming_threshold),
            ocr,
            phi,
            EntityMatcher::new(
                self.settings.fuzzy_threshold,
                self.settings.confidence_threshold,
                self.settings.mask_pad_px,
            ),
            ImageMasker::new(),
            &self.settings,
        );

        let input = self.buckets.phi.download(&job.input_key).await?;

        let result = match tokio::time::timeout(
            self.settings.soft_time_limit,
            pipeline.deidentify(&input, job.masking_level, None),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(JobError::Timeout(self.settings.soft_time_limit)),
        };

        let output_key = job.output_key_for("tiff");
        self.buckets
            .clean
            .upload(&output_key, &result.masked_bytes, "image/tiff")
            .await?;

        // Only after the clean artifact is durably written does the PHI
        // input stop being needed.
        self.buckets.phi.delete(&job.input_key).await?;

        let entities = stored_entities(&result);
        self.repository
            .mark_complete_with_entities(
                job.id,
                &output_key,
                result.pages_processed,
                result.entities_masked() as u32,
                result.processing_time_ms,
                entities,
            )
            .await?;

        info!(
            job_id = %job.id,
            pages = result.pages_processed,
            entities = result.phi_entities_count(),
            masked = result.entities_masked(),
            ms = result.processing_time_ms,
            "job complete"
        );
        Ok(())
    }

    /// Exponential backoff with jitter, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_base_delay.as_secs_f64();
        let cap = self.settings.retry_max_backoff.as_secs_f64();
        let exponential = base * 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64((exponential * jitter).min(cap))
    }
}

/// Flatten matched entities into persistable rows. Each row carries the
/// entity's first region (its page and box); unmatched entities are
/// recorded with zeroed geometry so the audit trail still shows what
/// was detected.
fn stored_entities(result: &DeidentificationResult) -> Vec<StoredPhiEntity> {
    result
        .entities
        .iter()
        .map(|matched| {
            let MatchedEntity { entity, regions } = matched;
            let first = regions.first();
            StoredPhiEntity {
                text: entity.text.clone(),
                category: entity.category.clone(),
                subcategory: entity.subcategory.clone(),
                page: first.map(|r| r.page).unwrap_or(1),
                confidence: entity.confidence,
                offset: entity.offset,
                length: entity.length,
                bbox_x: first.map(|r| r.bounding_box.x).unwrap_or(0.0),
                bbox_y: first.map(|r| r.bounding_box.y).unwrap_or(0.0),
                bbox_width: first.map(|r| r.bounding_box.width).unwrap_or(0.0),
                bbox_height: first.map(|r| r.bounding_box.height).unwrap_or(0.0),
            }
        })
        .collect()
}
