//! OCR via Azure Document Intelligence (prebuilt-read).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument, trace};

use super::{polygon_to_bbox, OcrError, OcrProvider};
use crate::config::Settings;
use crate::models::{DocumentFormat, OcrPage, OcrResult, OcrWord};

const API_VERSION: &str = "2023-07-31";
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_POLLS: u32 = 120;

/// OCR adapter for Azure Document Intelligence's prebuilt-read model.
///
/// The analyze call is asynchronous on Azure's side: submit returns an
/// Operation-Location to poll until the analysis succeeds or fails.
pub struct AzureOcrProvider {
    client: reqwest::Client,
    endpoint: String,
    key: String,
}

impl AzureOcrProvider {
    pub fn new(settings: &Settings) -> Result<Self, OcrError> {
        let azure = &settings.azure;
        if azure.document_intelligence_endpoint.is_empty()
            || azure.document_intelligence_key.is_empty()
        {
            return Err(OcrError::Auth(
                "AZURE_DI_ENDPOINT / AZURE_DI_KEY not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(settings.soft_time_limit.min(Duration::from_secs(120)))
            .build()
            .map_err(|e| OcrError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: azure.document_intelligence_endpoint.trim_end_matches('/').to_string(),
            key: azure.document_intelligence_key.clone(),
        })
    }

    async fn submit(&self, bytes: &[u8]) -> Result<String, OcrError> {
        let url = format!(
            "{}/formrecognizer/documentModels/prebuilt-read:analyze?api-version={}",
            self.endpoint, API_VERSION
        );
        let response = self
            .client
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| OcrError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &body_snippet(response).await));
        }
        response
            .headers()
            .get("operation-location")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| OcrError::Decode("missing Operation-Location header".to_string()))
    }

    async fn poll(&self, operation_url: &str) -> Result<AnalyzeResult, OcrError> {
        for _ in 0..MAX_POLLS {
            let response = self
                .client
                .get(operation_url)
                .header("Ocp-Apim-Subscription-Key", &self.key)
                .send()
                .await
                .map_err(|e| OcrError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(classify_status(status, &body_snippet(response).await));
            }
            let body: OperationStatus = response
                .json()
                .await
                .map_err(|e| OcrError::Decode(e.to_string()))?;
            trace!(status = %body.status, "Azure analyze poll");

            match body.status.as_str() {
                "succeeded" => {
                    return body.analyze_result.ok_or_else(|| {
                        OcrError::Decode("succeeded operation without analyzeResult".to_string())
                    })
                }
                "failed" => {
                    return Err(OcrError::Provider(
                        body.error
                            .map(|e| e.message)
                            .unwrap_or_else(|| "analysis failed".to_string()),
                    ))
                }
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
        Err(OcrError::Transport("Azure analyze operation timed out".to_string()))
    }
}

#[async_trait]
impl OcrProvider for AzureOcrProvider {
    #[instrument(level = "debug", skip_all, fields(bytes = bytes.len()))]
    async fn analyze(
        &self,
        bytes: &[u8],
        _format_hint: Option<DocumentFormat>,
        _language: Option<&str>,
    ) -> Result<OcrResult, OcrError> {
        let operation_url = self.submit(bytes).await?;
        let analyzed = self.poll(&operation_url).await?;
        let result = convert_result(analyzed)?;
        debug!(
            pages = result.pages.len(),
            words = result.word_count(),
            chars = result.full_text.len(),
            "Azure OCR complete"
        );
        Ok(result)
    }

    fn name(&self) -> &str {
        "azure"
    }
}

fn classify_status(status: StatusCode, body: &str) -> OcrError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            OcrError::Auth(format!("{status}: {body}"))
        }
        StatusCode::TOO_MANY_REQUESTS => OcrError::Quota(format!("{status}: {body}")),
        s if s.is_server_error() => OcrError::Transport(format!("{status}: {body}")),
        _ => OcrError::Provider(format!("{status}: {body}")),
    }
}

async fn body_snippet(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    text.chars().take(300).collect()
}

/// Normalize Azure's analyzeResult into the uniform model. Azure words
/// carry 8-coordinate polygons; pages report their own width/height in
/// the unit the polygons use.
fn convert_result(analyzed: AnalyzeResult) -> Result<OcrResult, OcrError> {
    let mut pages = Vec::with_capacity(analyzed.pages.len());
    for page in analyzed.pages {
        let mut words = Vec::with_capacity(page.words.len());
        for word in page.words {
            let bbox = polygon_to_bbox(&word.polygon, page.page_number)?;
            words.push(OcrWord {
                text: word.content,
                confidence: word.confidence.clamp(0.0, 1.0),
                bounding_box: bbox,
            });
        }
        pages.push(OcrPage {
            page_number: page.page_number,
            width: page.width,
            height: page.height,
            words,
        });
    }
    Ok(OcrResult {
        pages,
        full_text: analyzed.content,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationStatus {
    status: String,
    error: Option<OperationError>,
    analyze_result: Option<AnalyzeResult>,
}

#[derive(Debug, Deserialize)]
struct OperationError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult {
    content: String,
    #[serde(default)]
    pages: Vec<AnalyzePage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzePage {
    page_number: u32,
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
    #[serde(default)]
    words: Vec<AnalyzeWord>,
}

#[derive(Debug, Deserialize)]
struct AnalyzeWord {
    content: String,
    #[serde(default)]
    polygon: Vec<f64>,
    #[serde(default)]
    confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_result_collapses_polygons() {
        let analyzed: AnalyzeResult = serde_json::from_value(serde_json::json!({
            "content": "John Doe",
            "pages": [{
                "pageNumber": 1,
                "width": 8.5,
                "height": 11.0,
                "words": [
                    {"content": "John", "polygon": [1.0, 1.0, 2.0, 1.0, 2.0, 1.5, 1.0, 1.5], "confidence": 0.99},
                    {"content": "Doe", "polygon": [2.2, 1.0, 3.0, 1.1, 2.9, 1.6, 2.1, 1.5], "confidence": 0.97}
                ]
            }]
        }))
        .unwrap();

        let result = convert_result(analyzed).unwrap();
        assert_eq!(result.full_text, "John Doe");
        assert_eq!(result.pages.len(), 1);
        let doe = &result.pages[0].words[1];
        assert_eq!(doe.bounding_box.x, 2.1);
        assert_eq!(doe.bounding_box.y, 1.0);
        assert!((doe.bounding_box.width - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            OcrError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            OcrError::Quota(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            OcrError::Transport(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, ""),
            OcrError::Provider(_)
        ));
    }
}
