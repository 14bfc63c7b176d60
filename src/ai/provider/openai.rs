//! OpenAI API Provider
//!
//! Generation provider using OpenAI-compatible Chat Completions endpoints.
//! Attachments are sent as data-URL image parts.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{
    GenerationRequest, LlmProvider, LlmResponse, OutputMode, ResponseMetadata, ResponseTiming,
    TokenUsage, http_client, send_error, status_error, structured_instruction,
};
use crate::config::LlmConfig;
use crate::types::{CassandraError, Result, TransportError, TransportErrorKind};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const PROVIDER: &str = "openai";

/// OpenAI API Provider with secure API key handling
pub struct OpenAiProvider {
    /// API key stored securely - never exposed in logs or debug output
    api_key: SecretString,
    api_base: String,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                CassandraError::Config(
                    "OpenAI API key not found. Set OPENAI_API_KEY env var or llm.api_key in config"
                        .to_string(),
                )
            })?;

        let api_base = config
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        url::Url::parse(&api_base).map_err(|e| {
            CassandraError::Config(format!("Invalid api_base '{}': {}", api_base, e))
        })?;

        Ok(Self {
            api_key: SecretString::from(api_key),
            api_base: api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            client: http_client(config.timeout_secs)?,
        })
    }

    fn build_request(&self, request: &GenerationRequest) -> ChatCompletionRequest {
        let (system, response_format) = match &request.output_mode {
            OutputMode::FreeText => (request.system.clone(), None),
            OutputMode::Structured { schema } => (
                Some(structured_instruction(request.system.as_deref(), schema)),
                Some(ResponseFormat {
                    format_type: "json_object".to_string(),
                }),
            ),
        };

        let user_content = match &request.attachment {
            None => MessageContent::Text(request.prompt.clone()),
            Some(attachment) => MessageContent::Parts(vec![
                ContentPart::Text {
                    text: request.prompt.clone(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!(
                            "data:{};base64,{}",
                            attachment.mime_type,
                            attachment.base64()
                        ),
                    },
                },
            ]),
        };

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: MessageContent::Text(system),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: user_content,
        });

        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: request.temperature.unwrap_or(self.temperature),
            max_tokens: Some(request.max_output_tokens),
            response_format,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<LlmResponse> {
        info!(
            label = %request.label,
            model = %self.model,
            structured = request.output_mode.is_structured(),
            "Generating with OpenAI"
        );

        let start_time = Instant::now();
        let body = self.build_request(request);
        let url = format!("{}/chat/completions", self.api_base);

        let response = self
            .client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(e, PROVIDER))?;

        if !response.status().is_success() {
            return Err(status_error(response, PROVIDER).await);
        }

        let response_body: ChatCompletionResponse = response.json().await.map_err(|e| {
            CassandraError::Transport(TransportError::with_provider(
                TransportErrorKind::Transient,
                format!("Failed to decode OpenAI response: {}", e),
                PROVIDER,
            ))
        })?;

        let usage = response_body
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        let choice = response_body.choices.into_iter().next().ok_or_else(|| {
            CassandraError::Transport(TransportError::with_provider(
                TransportErrorKind::Transient,
                "No choices in OpenAI response",
                PROVIDER,
            ))
        })?;
        let text = choice.message.content.unwrap_or_default();

        debug!(label = %request.label, chars = text.len(), "Received OpenAI response");

        Ok(LlmResponse {
            text,
            usage,
            timing: ResponseTiming::from_duration(start_time.elapsed()),
            metadata: ResponseMetadata {
                model: self.model.clone(),
                provider: PROVIDER.to_string(),
                finish_reason: choice.finish_reason,
            },
        })
    }

    fn name(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.api_base);
        match self
            .client
            .get(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) => {
                warn!("OpenAI API check failed: {}", resp.status());
                Ok(false)
            }
            Err(e) => {
                warn!("OpenAI API check failed: {}", e);
                Ok(false)
            }
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    prompt_tokens: u32,
    completion_tokens: u32,
}
