//! End-to-end pipeline and job runner tests over mock providers.

use std::sync::Arc;
use std::time::Duration;

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use deidentify::config::Settings;
use deidentify::document::DocumentProcessor;
use deidentify::masking::ImageMasker;
use deidentify::matching::EntityMatcher;
use deidentify::models::{DocumentFormat, DocumentMetadata, Job, JobStatus, MaskingLevel};
use deidentify::ocr::MockOcrProvider;
use deidentify::phi::MockPhiDetector;
use deidentify::pipeline::DeidentificationPipeline;
use deidentify::repository::{Database, JobRepository};
use deidentify::runner::{JobRunner, ProviderRegistry};
use deidentify::storage::{BucketPair, LocalStorage, StorageBackend};

fn white_pages(count: usize, width: u32, height: u32) -> Vec<RgbImage> {
    (0..count)
        .map(|_| RgbImage::from_pixel(width, height, Rgb([255, 255, 255])))
        .collect()
}

fn tiff_document(pages: usize) -> Vec<u8> {
    let processor = DocumentProcessor::default();
    let mut metadata = DocumentMetadata::new(DocumentFormat::Tiff);
    metadata.dpi = Some((300, 300));
    processor
        .save(&white_pages(pages, 255, 330), &metadata, None)
        .unwrap()
}

fn pipeline_with(ocr: MockOcrProvider) -> DeidentificationPipeline {
    DeidentificationPipeline::with_defaults(
        Arc::new(ocr),
        Arc::new(MockPhiDetector::default()),
    )
}

struct JobHarness {
    _dir: TempDir,
    repo: JobRepository,
    settings: Settings,
    phi_dir: std::path::PathBuf,
    clean_dir: std::path::PathBuf,
}

impl JobHarness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("jobs.db");
        let repo = JobRepository::new(Database::new(&db_path.display().to_string()));
        repo.bootstrap().await.unwrap();

        let settings = Settings {
            retry_base_delay: Duration::from_secs(0),
            max_retries: 3,
            worker_poll_interval: Duration::from_millis(10),
            ..Settings::default()
        };

        Self {
            phi_dir: dir.path().join("phi"),
            clean_dir: dir.path().join("clean"),
            _dir: dir,
            repo,
            settings,
        }
    }

    fn buckets(&self) -> BucketPair {
        BucketPair {
            phi: Box::new(LocalStorage::new(&self.phi_dir).unwrap()),
            clean: Box::new(LocalStorage::new(&self.clean_dir).unwrap()),
        }
    }

    async fn submit(&self, bytes: &[u8]) -> Job {
        let mut job = Job::new("mock", "mock", MaskingLevel::SafeHarbor, String::new());
        job.input_key = format!("input/{}.tiff", job.id);
        self.buckets()
            .phi
            .upload(&job.input_key, bytes, "image/tiff")
            .await
            .unwrap();
        self.repo.create(&job).await.unwrap();
        job
    }

    fn runner(&self, ocr: MockOcrProvider) -> JobRunner {
        let mut registry = ProviderRegistry::new();
        registry.register_ocr("mock", Arc::new(ocr));
        registry.register_phi("mock", Arc::new(MockPhiDetector::default()));
        JobRunner::new(
            self.repo.clone(),
            self.buckets(),
            registry,
            self.settings.clone(),
        )
    }
}

#[tokio::test]
async fn test_small_document_end_to_end() {
    let bytes = tiff_document(1);
    let pipeline = pipeline_with(MockOcrProvider::with_text("Patient: John Doe"));

    let result = pipeline
        .deidentify(&bytes, MaskingLevel::SafeHarbor, None)
        .await
        .unwrap();

    assert_eq!(result.pages_processed, 1);
    assert_eq!(result.phi_entities_count(), result.entities.len());
    assert!(result.entities_masked() >= 1);

    // The output decodes to the same geometry as the input.
    let processor = DocumentProcessor::default();
    let (pages, metadata) = processor.load(&result.masked_bytes).unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(metadata.dpi, Some((300, 300)));
    assert_eq!(pages[0].dimensions(), (255, 330));

    // "John Doe" sits on the first synthetic line; after projecting the
    // mock's 2550x3300 geometry onto the 255x330 page the mask lands
    // around (36..56, 15..19).
    assert_eq!(pages[0].get_pixel(45, 17), &Rgb([0, 0, 0]));
    assert_eq!(pages[0].get_pixel(10, 10), &Rgb([255, 255, 255]));
}

#[tokio::test]
async fn test_masking_already_masked_output_is_stable() {
    let bytes = tiff_document(1);
    let pipeline = pipeline_with(MockOcrProvider::with_text("Patient: John Doe"));

    let first = pipeline
        .deidentify(&bytes, MaskingLevel::SafeHarbor, None)
        .await
        .unwrap();
    let second = pipeline
        .deidentify(&first.masked_bytes, MaskingLevel::SafeHarbor, None)
        .await
        .unwrap();

    let processor = DocumentProcessor::default();
    let (once, _) = processor.load(&first.masked_bytes).unwrap();
    let (twice, _) = processor.load(&second.masked_bytes).unwrap();
    assert_eq!(once.len(), twice.len());
    for (a, b) in once.iter().zip(twice.iter()) {
        assert_eq!(a.as_raw(), b.as_raw());
    }
}

#[tokio::test]
async fn test_batched_path_preserves_page_count() {
    let bytes = tiff_document(3);
    let settings = Settings {
        batch_size: 1,
        ..Settings::default()
    };
    let pipeline = DeidentificationPipeline::new(
        DocumentProcessor::new(settings.streaming_threshold),
        Arc::new(MockOcrProvider::with_text("Patient: John Doe")),
        Arc::new(MockPhiDetector::default()),
        EntityMatcher::default(),
        ImageMasker::new(),
        &settings,
    );

    let result = pipeline
        .deidentify(&bytes, MaskingLevel::SafeHarbor, None)
        .await
        .unwrap();
    assert_eq!(result.pages_processed, 3);

    let processor = DocumentProcessor::default();
    let (pages, _) = processor.load(&result.masked_bytes).unwrap();
    assert_eq!(pages.len(), 3);
    // Entities were detected in every batch.
    assert!(result.phi_entities_count() >= 3);
}

#[tokio::test]
async fn test_job_retry_then_complete() {
    let harness = JobHarness::new().await;
    let job = harness.submit(&tiff_document(1)).await;

    // First OCR call fails with a transport error; the runner schedules
    // a retry with zero base delay, so the second claim succeeds.
    let runner = harness.runner(MockOcrProvider::new().failing_first(1));

    assert_eq!(runner.run_once().await.unwrap(), Some(job.id));
    let after_failure = harness.repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(after_failure.status, JobStatus::Pending);
    assert_eq!(after_failure.retry_count, 1);

    assert_eq!(runner.run_once().await.unwrap(), Some(job.id));
    let complete = harness.repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(complete.status, JobStatus::Complete);
    assert_eq!(complete.retry_count, 1);
    assert!(complete.completed_at.is_some());

    // Two-bucket invariant for successful jobs: clean artifact exists,
    // PHI input is gone.
    let buckets = harness.buckets();
    let output_key = complete.output_key.unwrap();
    assert!(buckets.clean.exists(&output_key).await.unwrap());
    assert!(!buckets.phi.exists(&job.input_key).await.unwrap());

    // Entity rows were persisted with the COMPLETE transition.
    let entities = harness.repo.entities_for_job(job.id).await.unwrap();
    assert!(!entities.is_empty());
    assert!(entities.iter().any(|e| e.category == "Person"));
}

#[tokio::test]
async fn test_exhausted_retries_fail_without_output() {
    let harness = JobHarness::new().await;
    let job = harness.submit(&tiff_document(1)).await;

    // Every OCR call fails; retries exhaust.
    let runner = harness.runner(MockOcrProvider::new().failing_first(100));
    for _ in 0..4 {
        runner.run_once().await.unwrap();
    }

    let failed = harness.repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error_message.is_some());

    // No partial artifact leaks into the clean bucket, and the PHI
    // input is retained for a future corrected run.
    let buckets = harness.buckets();
    assert!(!buckets
        .clean
        .exists(&format!("masked/{}.tiff", job.id))
        .await
        .unwrap());
    assert!(buckets.phi.exists(&job.input_key).await.unwrap());
}

#[tokio::test]
async fn test_malformed_input_fails_terminally() {
    let harness = JobHarness::new().await;
    let mut job = Job::new("mock", "mock", MaskingLevel::SafeHarbor, String::new());
    job.input_key = format!("input/{}.tiff", job.id);
    harness
        .buckets()
        .phi
        .upload(&job.input_key, b"this is not a tiff", "image/tiff")
        .await
        .unwrap();
    harness.repo.create(&job).await.unwrap();

    let runner = harness.runner(MockOcrProvider::new());
    assert_eq!(runner.run_once().await.unwrap(), Some(job.id));

    // Format errors are terminal: no retry was scheduled.
    let failed = harness.repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 0);
}

#[tokio::test]
async fn test_missing_input_fails_terminally() {
    let harness = JobHarness::new().await;
    // Job row exists but nothing was uploaded.
    let job = Job::new("mock", "mock", MaskingLevel::SafeHarbor, "input/lost.tiff");
    harness.repo.create(&job).await.unwrap();

    let runner = harness.runner(MockOcrProvider::new());
    assert_eq!(runner.run_once().await.unwrap(), Some(job.id));

    let failed = harness.repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 0);
}

#[tokio::test]
async fn test_full_sample_record_masks_phi() {
    // The built-in sample record spans multiple pages and categories.
    let bytes = tiff_document(3);
    let pipeline = pipeline_with(MockOcrProvider::new().with_glyph_errors());

    let result = pipeline
        .deidentify(&bytes, MaskingLevel::SafeHarbor, None)
        .await
        .unwrap();

    assert!(result.phi_entities_count() > 5);
    // Glyph drift must not stop the bulk of entities from resolving.
    assert!(result.entities_masked() * 2 > result.phi_entities_count());

    let categories: std::collections::HashSet<&str> = result
        .phi_entities()
        .map(|e| e.category.as_str())
        .collect();
    assert!(categories.contains("Person"));
    assert!(categories.contains("MedicalRecordNumber"));
}
