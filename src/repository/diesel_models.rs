//! Diesel ORM models for the jobs and phi_entities tables.

use diesel::prelude::*;
use uuid::Uuid;

use super::{parse_datetime, parse_datetime_opt};
use crate::models::{Job, JobStatus, MaskingLevel};
use crate::schema;

/// Job record from the database.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct JobRecord {
    pub id: String,
    pub status: String,
    pub ocr_provider: String,
    pub phi_provider: String,
    pub masking_level: String,
    pub input_key: String,
    pub output_key: Option<String>,
    pub pages_processed: Option<i32>,
    pub phi_entities_masked: Option<i32>,
    pub processing_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub next_attempt_at: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

/// New job for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::jobs)]
pub struct NewJob<'a> {
    pub id: &'a str,
    pub status: &'a str,
    pub ocr_provider: &'a str,
    pub phi_provider: &'a str,
    pub masking_level: &'a str,
    pub input_key: &'a str,
    pub retry_count: i32,
    pub created_at: &'a str,
}

/// Convert a database record to a domain model.
impl From<JobRecord> for Job {
    fn from(record: JobRecord) -> Self {
        Job {
            id: Uuid::parse_str(&record.id).unwrap_or_else(|_| Uuid::nil()),
            status: JobStatus::from_str(&record.status).unwrap_or(JobStatus::Failed),
            ocr_provider: record.ocr_provider,
            phi_provider: record.phi_provider,
            masking_level: MaskingLevel::from_str(&record.masking_level)
                .unwrap_or(MaskingLevel::SafeHarbor),
            input_key: record.input_key,
            output_key: record.output_key,
            pages_processed: record.pages_processed.map(|v| v as u32),
            phi_entities_masked: record.phi_entities_masked.map(|v| v as u32),
            processing_time_ms: record.processing_time_ms.map(|v| v as u64),
            error_message: record.error_message,
            retry_count: record.retry_count.max(0) as u32,
            next_attempt_at: parse_datetime_opt(record.next_attempt_at),
            created_at: parse_datetime(&record.created_at),
            started_at: parse_datetime_opt(record.started_at),
            completed_at: parse_datetime_opt(record.completed_at),
        }
    }
}

/// Persisted PHI entity record.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = schema::phi_entities)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PhiEntityRecord {
    pub id: i32,
    pub job_id: String,
    pub text: String,
    pub category: String,
    pub subcategory: Option<String>,
    pub page: i32,
    pub confidence: f64,
    pub offset: i64,
    pub length: i64,
    pub bbox_x: f64,
    pub bbox_y: f64,
    pub bbox_width: f64,
    pub bbox_height: f64,
}

/// New PHI entity row for insertion.
#[derive(Insertable, Debug)]
#[diesel(table_name = schema::phi_entities)]
pub struct NewPhiEntity<'a> {
    pub job_id: &'a str,
    pub text: &'a str,
    pub category: &'a str,
    pub subcategory: Option<&'a str>,
    pub page: i32,
    pub confidence: f64,
    pub offset: i64,
    pub length: i64,
    pub bbox_x: f64,
    pub bbox_y: f64,
    pub bbox_width: f64,
    pub bbox_height: f64,
}
