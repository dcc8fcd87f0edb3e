//! PHI detection via Azure Language (PII recognition, healthcare domain).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{apply_masking_level, chunk_by_chars, sort_by_offset, PhiDetectError, PhiDetector};
use crate::config::Settings;
use crate::models::{MaskingLevel, PhiEntity};

const API_VERSION: &str = "2023-04-01";

/// Azure Language caps PII documents at 5120 text elements per call.
const MAX_CHARS_PER_CALL: usize = 5120;

/// Categories Azure uses for provider/organisation identifiers, which
/// LimitedDataset retains.
const PROVIDER_CATEGORIES: &[&str] = &["PersonType", "Organization"];

/// PHI detection adapter for Azure Language `PiiEntityRecognition` with
/// `domain=phi`.
pub struct AzurePhiDetector {
    client: reqwest::Client,
    endpoint: String,
    key: String,
    custom_categories: HashSet<String>,
}

impl AzurePhiDetector {
    pub fn new(
        settings: &Settings,
        custom_categories: HashSet<String>,
    ) -> Result<Self, PhiDetectError> {
        let azure = &settings.azure;
        if azure.language_endpoint.is_empty() || azure.language_key.is_empty() {
            return Err(PhiDetectError::Auth(
                "AZURE_LANGUAGE_ENDPOINT / AZURE_LANGUAGE_KEY not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(settings.soft_time_limit.min(Duration::from_secs(60)))
            .build()
            .map_err(|e| PhiDetectError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: azure.language_endpoint.trim_end_matches('/').to_string(),
            key: azure.language_key.clone(),
            custom_categories,
        })
    }

    async fn detect_chunk(&self, text: &str) -> Result<Vec<PiiEntity>, PhiDetectError> {
        let url = format!(
            "{}/language/:analyze-text?api-version={}",
            self.endpoint, API_VERSION
        );
        let request = AnalyzeRequest {
            kind: "PiiEntityRecognition",
            parameters: AnalyzeParameters {
                domain: "phi",
                // Offsets in Unicode scalar values, the matcher's domain.
                string_index_type: "UnicodeCodePoint",
            },
            analysis_input: AnalysisInput {
                documents: vec![InputDocument {
                    id: "1",
                    language: "en",
                    text,
                }],
            },
        };

        let response = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PhiDetectError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body: String = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body.chars().take(300).collect()));
        }

        let body: AnalyzeResponse = response
            .json()
            .await
            .map_err(|e| PhiDetectError::Decode(e.to_string()))?;
        if let Some(error) = body.results.errors.first() {
            return Err(PhiDetectError::Provider(error.error.message.clone()));
        }
        Ok(body
            .results
            .documents
            .into_iter()
            .next()
            .map(|d| d.entities)
            .unwrap_or_default())
    }
}

#[async_trait]
impl PhiDetector for AzurePhiDetector {
    #[instrument(level = "debug", skip_all, fields(chars = full_text.chars().count()))]
    async fn detect(
        &self,
        full_text: &str,
        level: MaskingLevel,
    ) -> Result<Vec<PhiEntity>, PhiDetectError> {
        let mut entities = Vec::new();
        for (chunk_offset, chunk) in chunk_by_chars(full_text, MAX_CHARS_PER_CALL) {
            if chunk.is_empty() {
                continue;
            }
            for raw in self.detect_chunk(chunk).await? {
                match PhiEntity::new(
                    raw.text,
                    raw.category,
                    raw.subcategory,
                    chunk_offset + raw.offset,
                    raw.length,
                    raw.confidence_score.clamp(0.0, 1.0),
                ) {
                    Ok(entity) => entities.push(entity),
                    Err(e) => warn!("dropping invalid Azure PII entity: {e}"),
                }
            }
        }

        let entities = apply_masking_level(entities, level, PROVIDER_CATEGORIES, &self.custom_categories);
        let entities = sort_by_offset(entities);
        debug!(entities = entities.len(), "Azure PHI detection complete");
        Ok(entities)
    }

    fn name(&self) -> &str {
        "azure"
    }
}

fn classify_status(status: StatusCode, body: String) -> PhiDetectError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            PhiDetectError::Auth(format!("{status}: {body}"))
        }
        StatusCode::TOO_MANY_REQUESTS => PhiDetectError::Quota(format!("{status}: {body}")),
        s if s.is_server_error() => PhiDetectError::Transport(format!("{status}: {body}")),
        _ => PhiDetectError::Provider(format!("{status}: {body}")),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    kind: &'a str,
    parameters: AnalyzeParameters<'a>,
    analysis_input: AnalysisInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeParameters<'a> {
    domain: &'a str,
    string_index_type: &'a str,
}

#[derive(Debug, Serialize)]
struct AnalysisInput<'a> {
    documents: Vec<InputDocument<'a>>,
}

#[derive(Debug, Serialize)]
struct InputDocument<'a> {
    id: &'a str,
    language: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    results: AnalyzeResults,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResults {
    #[serde(default)]
    documents: Vec<ResultDocument>,
    #[serde(default)]
    errors: Vec<DocumentError>,
}

#[derive(Debug, Deserialize)]
struct ResultDocument {
    #[serde(default)]
    entities: Vec<PiiEntity>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PiiEntity {
    text: String,
    category: String,
    #[serde(default)]
    subcategory: Option<String>,
    offset: usize,
    length: usize,
    confidence_score: f64,
}

#[derive(Debug, Deserialize)]
struct DocumentError {
    error: InnerError,
}

#[derive(Debug, Deserialize)]
struct InnerError {
    message: String,
}
