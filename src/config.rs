//! Environment-driven configuration.
//!
//! Every knob is read from the process environment (after dotenvy has
//! loaded any `.env` file in `main`). Components receive a cloned
//! `Settings` at startup; nothing re-reads the environment later.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::MaskingLevel;

/// Deployment environment. Debug masking refuses to run in production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentEnv {
    Development,
    Production,
}

impl DeploymentEnv {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "development" | "dev" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }
}

/// Which storage implementation backs a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Local,
    S3,
}

/// Settings for one bucket namespace.
///
/// The PHI and clean buckets are configured independently so they can
/// live behind separate credentials and namespaces; that separation is
/// the structural defence against re-exposing raw PHI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSettings {
    pub kind: StorageKind,
    /// Base directory for local storage.
    pub path: String,
    /// Bucket name for S3 storage.
    pub bucket: String,
    /// Key prefix inside the S3 bucket.
    pub prefix: String,
}

impl BucketSettings {
    fn from_env(prefix: &str, default_path: &str) -> Self {
        let kind = match env_string(&format!("{prefix}_STORAGE_BACKEND"), "local").as_str() {
            "s3" => StorageKind::S3,
            _ => StorageKind::Local,
        };
        Self {
            kind,
            path: env_string(&format!("{prefix}_STORAGE_PATH"), default_path),
            bucket: env_string(&format!("{prefix}_STORAGE_BUCKET"), ""),
            prefix: env_string(&format!("{prefix}_STORAGE_PREFIX"), ""),
        }
    }
}

/// Credentials and endpoints for the Azure providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureSettings {
    pub document_intelligence_endpoint: String,
    pub document_intelligence_key: String,
    pub language_endpoint: String,
    pub language_key: String,
}

impl AzureSettings {
    fn from_env() -> Self {
        Self {
            document_intelligence_endpoint: env_string("AZURE_DI_ENDPOINT", ""),
            document_intelligence_key: env_string("AZURE_DI_KEY", ""),
            language_endpoint: env_string("AZURE_LANGUAGE_ENDPOINT", ""),
            language_key: env_string("AZURE_LANGUAGE_KEY", ""),
        }
    }
}

/// Runtime settings for the whole system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub deployment_env: DeploymentEnv,

    // Providers
    pub ocr_provider: String,
    pub phi_provider: String,
    pub masking_level: MaskingLevel,
    /// Categories masked under MaskingLevel::Custom.
    pub custom_phi_categories: Vec<String>,
    pub azure: AzureSettings,

    // Storage
    pub phi_bucket: BucketSettings,
    pub clean_bucket: BucketSettings,

    // Pipeline knobs
    pub max_file_size_mb: u64,
    pub mask_pad_px: u32,
    pub fuzzy_threshold: usize,
    pub confidence_threshold: f64,
    pub batch_size: usize,
    pub streaming_threshold: usize,
    /// Fail-open switch for batch failures in the large-document path.
    /// Leave off unless an operator explicitly prefers availability over
    /// guaranteed masking.
    pub fail_open: bool,

    // Job runner knobs
    pub task_time_limit: Duration,
    pub soft_time_limit: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_backoff: Duration,
    pub worker_poll_interval: Duration,
}

impl Settings {
    /// Load settings from the environment, applying defaults for
    /// anything unset.
    pub fn from_env() -> Self {
        Self {
            database_url: env_string("DATABASE_URL", "deidentify.db"),
            deployment_env: DeploymentEnv::from_str(&env_string("DEID_ENV", "development"))
                .unwrap_or(DeploymentEnv::Development),

            ocr_provider: env_string("OCR_PROVIDER", "mock"),
            phi_provider: env_string("PHI_PROVIDER", "mock"),
            masking_level: MaskingLevel::from_str(&env_string("MASKING_LEVEL", "safe_harbor"))
                .unwrap_or(MaskingLevel::SafeHarbor),
            custom_phi_categories: env_list("CUSTOM_PHI_CATEGORIES"),
            azure: AzureSettings::from_env(),

            phi_bucket: BucketSettings::from_env("PHI", "storage/phi"),
            clean_bucket: BucketSettings::from_env("CLEAN", "storage/clean"),

            max_file_size_mb: env_parse("MAX_FILE_SIZE_MB", 50),
            mask_pad_px: env_parse("MASK_PAD_PX", 5),
            fuzzy_threshold: env_parse("FUZZY_THRESHOLD", 2),
            confidence_threshold: env_parse("CONF_THRESHOLD", 0.0),
            batch_size: env_parse("BATCH_SIZE", 25),
            streaming_threshold: env_parse("STREAMING_THRESHOLD", 50),
            fail_open: env_parse("DEID_FAIL_OPEN", false),

            task_time_limit: Duration::from_secs(env_parse("TASK_TIME_LIMIT", 600)),
            soft_time_limit: Duration::from_secs(env_parse("SOFT_TIME_LIMIT", 540)),
            max_retries: env_parse("MAX_RETRIES", 3),
            retry_base_delay: Duration::from_secs(env_parse("RETRY_BASE_DELAY", 5)),
            retry_max_backoff: Duration::from_secs(env_parse("RETRY_MAX_BACKOFF", 600)),
            worker_poll_interval: Duration::from_secs(env_parse("WORKER_POLL_INTERVAL", 2)),
        }
    }

    /// Maximum accepted upload size in bytes.
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

impl Default for Settings {
    /// Defaults without consulting the environment (used by tests).
    fn default() -> Self {
        Self {
            database_url: "deidentify.db".to_string(),
            deployment_env: DeploymentEnv::Development,
            ocr_provider: "mock".to_string(),
            phi_provider: "mock".to_string(),
            masking_level: MaskingLevel::SafeHarbor,
            custom_phi_categories: Vec::new(),
            azure: AzureSettings::default(),
            phi_bucket: BucketSettings {
                kind: StorageKind::Local,
                path: "storage/phi".to_string(),
                bucket: String::new(),
                prefix: String::new(),
            },
            clean_bucket: BucketSettings {
                kind: StorageKind::Local,
                path: "storage/clean".to_string(),
                bucket: String::new(),
                prefix: String::new(),
            },
            max_file_size_mb: 50,
            mask_pad_px: 5,
            fuzzy_threshold: 2,
            confidence_threshold: 0.0,
            batch_size: 25,
            streaming_threshold: 50,
            fail_open: false,
            task_time_limit: Duration::from_secs(600),
            soft_time_limit: Duration::from_secs(540),
            max_retries: 3,
            retry_base_delay: Duration::from_secs(5),
            retry_max_backoff: Duration::from_secs(600),
            worker_poll_interval: Duration::from_secs(2),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("ignoring invalid {key}={raw:?}: {e}");
                default
            }
        },
        Err(_) => default,
    }
}

/// Comma-separated list, trimmed, empties dropped.
fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.mask_pad_px, 5);
        assert_eq!(settings.fuzzy_threshold, 2);
        assert_eq!(settings.batch_size, 25);
        assert_eq!(settings.streaming_threshold, 50);
        assert!(!settings.fail_open);
        assert!(settings.soft_time_limit < settings.task_time_limit);
    }

    #[test]
    fn test_max_file_size_bytes() {
        let settings = Settings::default();
        assert_eq!(settings.max_file_size_bytes(), 50 * 1024 * 1024);
    }

    #[test]
    fn test_deployment_env_parsing() {
        assert_eq!(
            DeploymentEnv::from_str("production"),
            Some(DeploymentEnv::Production)
        );
        assert_eq!(
            DeploymentEnv::from_str("dev"),
            Some(DeploymentEnv::Development)
        );
        assert_eq!(DeploymentEnv::from_str("staging"), None);
    }
}
