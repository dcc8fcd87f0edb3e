//! CLI command implementations.

use std::path::Path;

use anyhow::{anyhow, bail, Context};
use tracing::info;
use uuid::Uuid;

use crate::config::Settings;
use crate::document::DocumentProcessor;
use crate::masking::ImageMasker;
use crate::matching::EntityMatcher;
use crate::models::{Job, MaskingLevel};
use crate::pipeline::DeidentificationPipeline;
use crate::repository::{Database, JobRepository};
use crate::runner::{JobRunner, ProviderRegistry};
use crate::storage::BucketPair;
use crate::{ocr, phi};

fn masking_level(settings: &Settings, flag: Option<String>) -> anyhow::Result<MaskingLevel> {
    match flag {
        None => Ok(settings.masking_level),
        Some(value) => MaskingLevel::from_str(&value)
            .ok_or_else(|| anyhow!("unknown masking level {value:?}")),
    }
}

async fn repository(settings: &Settings) -> anyhow::Result<JobRepository> {
    let repo = JobRepository::new(Database::new(&settings.database_url));
    repo.bootstrap().await.context("database bootstrap failed")?;
    Ok(repo)
}

pub async fn submit(
    settings: &Settings,
    file: &Path,
    level: Option<String>,
) -> anyhow::Result<()> {
    let level = masking_level(settings, level)?;
    let bytes = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    if bytes.len() as u64 > settings.max_file_size_bytes() {
        bail!(
            "{} is {} bytes; maximum accepted size is {} MB",
            file.display(),
            bytes.len(),
            settings.max_file_size_mb
        );
    }
    let format = DocumentProcessor::detect_format(&bytes)?;

    let repo = repository(settings).await?;
    let buckets = BucketPair::from_settings(settings).await?;

    let mut job = Job::new(
        &settings.ocr_provider,
        &settings.phi_provider,
        level,
        String::new(),
    );
    job.input_key = format!("input/{}.{}", job.id, format.extension());

    buckets
        .phi
        .upload(&job.input_key, &bytes, format.mime_type())
        .await?;
    repo.create(&job).await?;

    println!("{}", job.id);
    info!(job_id = %job.id, input_key = %job.input_key, "job submitted");
    Ok(())
}

pub async fn worker(settings: &Settings, once: bool) -> anyhow::Result<()> {
    let repo = repository(settings).await?;
    let buckets = BucketPair::from_settings(settings).await?;
    let registry = ProviderRegistry::from_settings(settings).await?;
    let runner = JobRunner::new(repo, buckets, registry, settings.clone());

    if once {
        match runner.run_once().await? {
            Some(job_id) => println!("processed {job_id}"),
            None => println!("queue empty"),
        }
        return Ok(());
    }

    tokio::select! {
        result = runner.run() => result.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("worker shutting down");
            Ok(())
        }
    }
}

pub async fn status(settings: &Settings, job_id: Uuid) -> anyhow::Result<()> {
    let repo = repository(settings).await?;
    let job = repo
        .get(job_id)
        .await?
        .ok_or_else(|| anyhow!("job {job_id} not found"))?;

    println!("id:               {}", job.id);
    println!("status:           {}", job.status.as_str());
    println!("masking level:    {}", job.masking_level.as_str());
    println!("providers:        ocr={} phi={}", job.ocr_provider, job.phi_provider);
    println!("input key:        {}", job.input_key);
    if let Some(output_key) = &job.output_key {
        println!("output key:       {output_key}");
    }
    if let Some(pages) = job.pages_processed {
        println!("pages processed:  {pages}");
    }
    if let Some(masked) = job.phi_entities_masked {
        println!("entities masked:  {masked}");
    }
    if let Some(ms) = job.processing_time_ms {
        println!("processing time:  {ms} ms");
    }
    println!("retries:          {}", job.retry_count);
    if let Some(error) = &job.error_message {
        println!("error:            {error}");
    }
    Ok(())
}

pub async fn jobs(settings: &Settings, limit: u32) -> anyhow::Result<()> {
    let repo = repository(settings).await?;
    let jobs = repo.list_recent(limit).await?;
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<10}  retries={}  {}",
            job.id,
            job.status.as_str(),
            job.retry_count,
            job.created_at.to_rfc3339(),
        );
    }
    Ok(())
}

pub async fn entities(settings: &Settings, job_id: Uuid) -> anyhow::Result<()> {
    let repo = repository(settings).await?;
    let entities = repo.entities_for_job(job_id).await?;
    if entities.is_empty() {
        println!("no entities recorded for {job_id}");
        return Ok(());
    }
    for entity in entities {
        println!(
            "page {:>3}  {:<24}  conf={:.2}  offset={} len={}  bbox=({:.1},{:.1},{:.1},{:.1})",
            entity.page,
            entity.category,
            entity.confidence,
            entity.offset,
            entity.length,
            entity.bbox_x,
            entity.bbox_y,
            entity.bbox_width,
            entity.bbox_height,
        );
    }
    Ok(())
}

pub async fn run_local(
    settings: &Settings,
    file: &Path,
    output: &Path,
    level: Option<String>,
    debug_masks: bool,
) -> anyhow::Result<()> {
    let level = masking_level(settings, level)?;
    let ocr_provider = ocr::provider_for(&settings.ocr_provider, settings).await?;
    let phi_detector = phi::detector_for(&settings.phi_provider, settings).await?;

    let masker = if debug_masks {
        ImageMasker::debug_mode(settings.deployment_env)?
    } else {
        ImageMasker::new()
    };
    let pipeline = DeidentificationPipeline::new(
        DocumentProcessor::new(settings.streaming_threshold),
        ocr_provider,
        phi_detector,
        EntityMatcher::new(
            settings.fuzzy_threshold,
            settings.confidence_threshold,
            settings.mask_pad_px,
        ),
        masker,
        settings,
    );

    let result = pipeline.deidentify_from_path(file, level, None).await?;
    std::fs::write(output, &result.masked_bytes)
        .with_context(|| format!("writing {}", output.display()))?;

    println!(
        "masked {} pages, {} entities detected, {} masked, {} regions, {} ms",
        result.pages_processed,
        result.phi_entities_count(),
        result.entities_masked(),
        result.mask_regions().count(),
        result.processing_time_ms,
    );
    for warning in &result.errors {
        println!("warning: {warning}");
    }
    Ok(())
}
