//! PHI de-identification for scanned medical documents.
//!
//! The pipeline takes a multi-page TIFF or PDF raster, finds every
//! region containing Protected Health Information, and returns a
//! visually identical document with those regions painted over. Around
//! it sits the durable job machinery: a claim-queue job table, a PHI
//! bucket / clean bucket storage split, and a worker that retries
//! transient failures with backoff.

pub mod cli;
pub mod config;
pub mod document;
pub mod masking;
pub mod matching;
pub mod models;
pub mod ocr;
pub mod phi;
pub mod pipeline;
pub mod repository;
pub mod runner;
pub mod schema;
pub mod storage;
