//! Durable de-identification jobs.
//!
//! A job row is the unit of durable state: it records which document to
//! process, how far processing got, and the outcome. The jobs table
//! doubles as the work queue (see `repository::jobs`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MaskingLevel;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// A de-identification job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub ocr_provider: String,
    pub phi_provider: String,
    pub masking_level: MaskingLevel,
    /// Key of the raw input in the PHI bucket.
    pub input_key: String,
    /// Key of the masked artifact in the clean bucket, once complete.
    pub output_key: Option<String>,
    pub pages_processed: Option<u32>,
    pub phi_entities_masked: Option<u32>,
    pub processing_time_ms: Option<u64>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Earliest time the next attempt may be claimed; None means
    /// immediately eligible.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job for an uploaded input object.
    pub fn new(
        ocr_provider: impl Into<String>,
        phi_provider: impl Into<String>,
        masking_level: MaskingLevel,
        input_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            ocr_provider: ocr_provider.into(),
            phi_provider: phi_provider.into(),
            masking_level,
            input_key: input_key.into(),
            output_key: None,
            pages_processed: None,
            phi_entities_masked: None,
            processing_time_ms: None,
            error_message: None,
            retry_count: 0,
            next_attempt_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Deterministic clean-bucket key for this job's output artifact.
    /// Repeat uploads overwrite idempotently.
    pub fn output_key_for(&self, extension: &str) -> String {
        format!("masked/{}.{}", self.id, extension)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Complete,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = Job::new("mock", "mock", MaskingLevel::SafeHarbor, "input/x.tiff");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.output_key.is_none());
    }

    #[test]
    fn test_output_key_is_deterministic() {
        let job = Job::new("mock", "mock", MaskingLevel::SafeHarbor, "input/x.tiff");
        assert_eq!(job.output_key_for("tiff"), job.output_key_for("tiff"));
        assert!(job.output_key_for("tiff").starts_with("masked/"));
    }
}
