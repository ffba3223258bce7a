//! Image → text through a vision-capable chat model.
//!
//! The primary model is tried first, then each fallback in declared order.
//! A model is skipped on any call failure (after the resilient caller's own
//! retries) or when its result fails validation: empty text, or confidence
//! below the configured minimum.

use base64::Engine as _;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatRequest, LlmError, LlmGateway};
use crate::metrics::Metrics;
use crate::models::{clamp_unit, OcrResult};
use crate::parse::{self, lenient};
use crate::prompts;

/// Confidence assigned when the model returns bare text instead of the
/// requested JSON object, or omits the score.
const UNSCORED_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("cannot read OCR input: {0}")]
    Input(String),
    #[error("all OCR models failed; last cause: {last_cause}")]
    Exhausted { last_cause: String },
    #[error("canceled")]
    Canceled,
}

#[derive(Debug, Deserialize)]
struct OcrPayload {
    #[serde(alias = "content", alias = "extracted_text")]
    text: String,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    confidence: Option<f64>,
}

#[derive(Debug)]
enum ModelFailure {
    Call(LlmError),
    Rejected(String),
    Canceled,
}

impl std::fmt::Display for ModelFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelFailure::Call(e) => write!(f, "{}", e),
            ModelFailure::Rejected(reason) => write!(f, "result rejected: {}", reason),
            ModelFailure::Canceled => f.write_str("canceled"),
        }
    }
}

pub struct OcrEngine {
    gateway: LlmGateway,
    provider: String,
    primary: String,
    fallbacks: Vec<String>,
    min_confidence: f64,
    metrics: Arc<Metrics>,
}

impl OcrEngine {
    pub fn new(
        gateway: LlmGateway,
        provider: &str,
        primary: &str,
        fallbacks: Vec<String>,
        min_confidence: f64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            gateway,
            provider: provider.to_string(),
            primary: primary.to_string(),
            fallbacks,
            min_confidence,
            metrics,
        }
    }

    /// Primary model followed by the fallbacks, without duplicates.
    pub fn model_chain(&self) -> Vec<&str> {
        let mut chain: Vec<&str> = vec![self.primary.as_str()];
        for model in &self.fallbacks {
            if !chain.contains(&model.as_str()) {
                chain.push(model);
            }
        }
        chain
    }

    /// OCR an image given as a remote URL, a data URL, or a local path.
    pub async fn extract(
        &self,
        cancel: &CancellationToken,
        image: &str,
    ) -> Result<OcrResult, OcrError> {
        let url = if is_fetchable_url(image) {
            image.to_string()
        } else {
            let path = Path::new(image);
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| OcrError::Input(format!("{}: {}", path.display(), e)))?;
            data_url(&bytes, image_mime_for(path))
        };
        self.extract_url(cancel, &url).await
    }

    pub async fn extract_bytes(
        &self,
        cancel: &CancellationToken,
        bytes: &[u8],
        mime: &str,
    ) -> Result<OcrResult, OcrError> {
        self.extract_url(cancel, &data_url(bytes, mime)).await
    }

    async fn extract_url(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<OcrResult, OcrError> {
        let mut last_cause = String::from("no OCR model configured");

        for model in self.model_chain() {
            let labels = [("model", model)];
            self.metrics.incr("ocr_requests_total", &labels);
            let started = Instant::now();
            let outcome = self.try_model(cancel, model, url).await;
            self.metrics
                .observe("ocr_request_duration_seconds", &labels, started.elapsed());

            match outcome {
                Ok(result) => {
                    tracing::debug!(model, confidence = result.confidence, "OCR succeeded");
                    return Ok(result);
                }
                Err(ModelFailure::Canceled) => return Err(OcrError::Canceled),
                Err(failure) => {
                    self.metrics.incr("ocr_errors_total", &labels);
                    tracing::warn!(model, error = %failure, "OCR model failed, trying next");
                    last_cause = format!("{}: {}", model, failure);
                }
            }
        }

        Err(OcrError::Exhausted { last_cause })
    }

    async fn try_model(
        &self,
        cancel: &CancellationToken,
        model: &str,
        url: &str,
    ) -> Result<OcrResult, ModelFailure> {
        let request =
            ChatRequest::multimodal(model, prompts::ocr_instruction(), vec![url.to_string()]);
        let response = self
            .gateway
            .execute(cancel, &self.provider, &request)
            .await
            .map_err(|e| match e {
                LlmError::Canceled => ModelFailure::Canceled,
                other => ModelFailure::Call(other),
            })?;

        let content = parse::message_content(&response.body)
            .map_err(|e| ModelFailure::Rejected(e.to_string()))?;
        let result = match parse::parse_content::<OcrPayload>(&content) {
            Ok(payload) => OcrResult {
                text: payload.text.trim().to_string(),
                confidence: clamp_unit(payload.confidence.unwrap_or(UNSCORED_CONFIDENCE)),
            },
            Err(_) => OcrResult {
                text: content.trim().to_string(),
                confidence: UNSCORED_CONFIDENCE,
            },
        };
        self.validate(&result).map_err(ModelFailure::Rejected)?;
        Ok(result)
    }

    fn validate(&self, result: &OcrResult) -> Result<(), String> {
        if result.text.trim().is_empty() {
            return Err("empty text".to_string());
        }
        if result.confidence < self.min_confidence {
            return Err(format!(
                "confidence {:.2} below minimum {:.2}",
                result.confidence, self.min_confidence
            ));
        }
        Ok(())
    }
}

fn is_fetchable_url(s: &str) -> bool {
    s.starts_with("https://") || s.starts_with("http://") || s.starts_with("data:")
}

fn image_mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => "image/jpeg",
    }
}

pub fn data_url(bytes: &[u8], mime: &str) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}
