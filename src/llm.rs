//! LLM provider gateway.
//!
//! Providers share one capability: take a chat-completions request, return
//! the raw response envelope. [`LlmGateway`] is an immutable registry from
//! provider id to provider, built once at startup and shared by reference.
//! It does not look inside message content; that is
//! [`parse`](crate::parse)'s job.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::resilience::{CallError, HttpRequest, ResilientCaller};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

impl ChatRequest {
    /// Single user message asking for a JSON object.
    pub fn json(model: &str, prompt: String) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Text(prompt),
            }],
            response_format: Some(ResponseFormat {
                kind: "json_object".to_string(),
            }),
            temperature: Some(0.1),
            max_tokens: None,
        }
    }

    /// One text block followed by one image block per URL (data URL or https).
    pub fn multimodal(model: &str, instructions: String, image_urls: Vec<String>) -> Self {
        let mut parts = vec![ContentPart::Text { text: instructions }];
        parts.extend(image_urls.into_iter().map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl { url },
        }));
        Self {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Parts(parts),
            }],
            response_format: Some(ResponseFormat {
                kind: "json_object".to_string(),
            }),
            temperature: Some(0.1),
            max_tokens: None,
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Puts a system message in front of the conversation.
    pub fn with_system_prepend(mut self, system: &str) -> Self {
        self.messages.insert(
            0,
            ChatMessage {
                role: "system".to_string(),
                content: MessageContent::Text(system.to_string()),
            },
        );
        self
    }

    pub fn image_count(&self) -> usize {
        self.messages
            .iter()
            .map(|m| match &m.content {
                MessageContent::Parts(parts) => parts
                    .iter()
                    .filter(|p| matches!(p, ContentPart::ImageUrl { .. }))
                    .count(),
                MessageContent::Text(_) => 0,
            })
            .sum()
    }

    /// All text content, concatenated. Used in logs and by test fakes.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for message in &self.messages {
            match &message.content {
                MessageContent::Text(t) => out.push_str(t),
                MessageContent::Parts(parts) => {
                    for part in parts {
                        if let ContentPart::Text { text } = part {
                            out.push_str(text);
                        }
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("unsupported LLM provider: {0}")]
    UnsupportedProvider(String),
    #[error("provider unavailable: {0}")]
    Unavailable(#[source] CallError),
    #[error("provider rejected request with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("canceled")]
    Canceled,
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::UnsupportedProvider(_) | LlmError::Rejected { .. } => ErrorKind::Upstream,
            LlmError::Unavailable(_) => ErrorKind::UpstreamUnavailable,
            LlmError::Canceled => ErrorKind::Canceled,
        }
    }
}

impl From<CallError> for LlmError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Canceled => LlmError::Canceled,
            CallError::Http { status, body } if !(status == 429 || status >= 500) => {
                LlmError::Rejected { status, body }
            }
            other => LlmError::Unavailable(other),
        }
    }
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<LlmResponse, LlmError>;

    /// Whether the provider currently accepts calls (breaker closed).
    fn available(&self) -> bool {
        true
    }
}

/// OpenAI-compatible `POST {base}/chat/completions` provider (OpenRouter,
/// DashScope compatible mode, ...).
pub struct ChatCompletionsProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    caller: ResilientCaller,
}

impl ChatCompletionsProvider {
    /// `caller` should carry the provider's attribution headers
    /// (`HTTP-Referer`, `X-Title`) as defaults.
    pub fn new(id: &str, base_url: &str, api_key: Option<String>, caller: ResilientCaller) -> Self {
        Self {
            id: id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            caller,
        }
    }
}

#[async_trait]
impl LlmProvider for ChatCompletionsProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &ChatRequest,
    ) -> Result<LlmResponse, LlmError> {
        let body = serde_json::to_value(request)
            .map_err(|e| LlmError::Unavailable(CallError::Network(e.to_string())))?;
        let mut http = HttpRequest::post_json(format!("{}/chat/completions", self.base_url), &body);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            http.set_header("Authorization", &format!("Bearer {}", key));
        }

        let response = self.caller.call(cancel, http).await?;
        Ok(LlmResponse {
            status: response.status,
            body: response.body,
        })
    }

    fn available(&self) -> bool {
        !self.caller.breaker_open()
    }
}

#[derive(Clone, Default)]
pub struct LlmGateway {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl LlmGateway {
    pub fn builder() -> LlmGatewayBuilder {
        LlmGatewayBuilder::default()
    }

    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        provider_id: &str,
        request: &ChatRequest,
    ) -> Result<LlmResponse, LlmError> {
        let provider = self
            .providers
            .get(provider_id)
            .ok_or_else(|| LlmError::UnsupportedProvider(provider_id.to_string()))?;
        tracing::debug!(
            provider = provider_id,
            model = %request.model,
            images = request.image_count(),
            "dispatching LLM request"
        );
        provider.execute(cancel, request).await
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// `(provider id, available)` for readiness reporting.
    pub fn availability(&self) -> Vec<(String, bool)> {
        self.provider_ids()
            .into_iter()
            .map(|id| {
                let up = self.providers.get(&id).is_some_and(|p| p.available());
                (id, up)
            })
            .collect()
    }
}

#[derive(Default)]
pub struct LlmGatewayBuilder {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl LlmGatewayBuilder {
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.insert(provider.id().to_string(), provider);
        self
    }

    pub fn build(self) -> LlmGateway {
        LlmGateway {
            providers: self.providers,
        }
    }
}
