//! Structured-JSON requests: execute through the gateway, parse the
//! envelope, and retry once with a stricter instruction when the model's
//! answer does not parse.

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, PipelineError, PipelineResult, Stage};
use crate::llm::{ChatRequest, LlmError, LlmGateway};
use crate::parse;
use crate::prompts;

#[derive(Clone)]
pub struct StructuredClient {
    gateway: LlmGateway,
    provider: String,
}

impl StructuredClient {
    pub fn new(gateway: LlmGateway, provider: &str) -> Self {
        Self {
            gateway,
            provider: provider.to_string(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn gateway(&self) -> &LlmGateway {
        &self.gateway
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        request: ChatRequest,
        stage: Stage,
    ) -> PipelineResult<T> {
        let response = self
            .gateway
            .execute(cancel, &self.provider, &request)
            .await
            .map_err(|e| llm_failure(stage, e))?;

        let first_err = match parse::parse::<T>(&response.body) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        tracing::warn!(
            %stage,
            model = %request.model,
            error = %first_err,
            "unparseable model output, retrying with JSON-only instruction"
        );

        let strict = request.with_system_prepend(prompts::JSON_ONLY_SYSTEM);
        let response = self
            .gateway
            .execute(cancel, &self.provider, &strict)
            .await
            .map_err(|e| llm_failure(stage, e))?;
        parse::parse::<T>(&response.body)
            .map_err(|e| PipelineError::new(stage, ErrorKind::Parse, e.to_string()))
    }
}

pub fn llm_failure(stage: Stage, err: LlmError) -> PipelineError {
    PipelineError::new(stage, err.kind(), err.to_string())
}
