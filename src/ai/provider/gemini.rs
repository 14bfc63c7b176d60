//! Gemini API Provider
//!
//! Generation provider using the Gemini `generateContent` REST endpoint.
//! Attachments are sent inline as base64 parts; structured mode requests
//! `application/json` output and embeds the schema in the system instruction.

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

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const PROVIDER: &str = "gemini";

/// Gemini API Provider with secure API key handling
pub struct GeminiProvider {
    /// API key stored securely - never exposed in logs or debug output
    api_key: SecretString,
    api_base: url::Url,
    model: String,
    temperature: f32,
    client: reqwest::Client,
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("api_key", &"[REDACTED]")
            .field("api_base", &self.api_base.as_str())
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl GeminiProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok())
            .ok_or_else(|| {
                CassandraError::Config(
                    "Gemini API key not found. Set GEMINI_API_KEY env var or llm.api_key in config"
                        .to_string(),
                )
            })?;

        let base = config.api_base.as_deref().unwrap_or(DEFAULT_API_BASE);
        let api_base = url::Url::parse(base.trim_end_matches('/'))
            .map_err(|e| CassandraError::Config(format!("Invalid api_base '{}': {}", base, e)))?;

        Ok(Self {
            api_key: SecretString::from(api_key),
            api_base,
            model: config.model.clone(),
            temperature: config.temperature,
            client: http_client(config.timeout_secs)?,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.api_base.as_str().trim_end_matches('/'),
            self.model
        )
    }

    fn build_request(&self, request: &GenerationRequest) -> GenerateContentRequest {
        let mut parts = vec![Part::Text {
            text: request.prompt.clone(),
        }];
        if let Some(attachment) = &request.attachment {
            parts.push(Part::InlineData {
                inline_data: InlineData {
                    mime_type: attachment.mime_type.clone(),
                    data: attachment.base64(),
                },
            });
        }

        let (system, response_mime_type) = match &request.output_mode {
            OutputMode::FreeText => (request.system.clone(), None),
            OutputMode::Structured { schema } => (
                Some(structured_instruction(request.system.as_deref(), schema)),
                Some("application/json".to_string()),
            ),
        };

        GenerateContentRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts,
            }],
            system_instruction: system.map(|text| SystemInstruction {
                parts: vec![Part::Text { text }],
            }),
            generation_config: GenerationConfig {
                temperature: request.temperature.unwrap_or(self.temperature),
                max_output_tokens: request.max_output_tokens,
                response_mime_type,
            },
        }
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<LlmResponse> {
        info!(
            label = %request.label,
            model = %self.model,
            structured = request.output_mode.is_structured(),
            attachment = request.attachment.is_some(),
            "Generating with Gemini"
        );

        let start_time = Instant::now();
        let body = self.build_request(request);

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(e, PROVIDER))?;

        if !response.status().is_success() {
            return Err(status_error(response, PROVIDER).await);
        }

        let parsed: GenerateContentResponse = response.json().await.map_err(|e| {
            CassandraError::Transport(TransportError::with_provider(
                TransportErrorKind::Transient,
                format!("Failed to decode Gemini response: {}", e),
                PROVIDER,
            ))
        })?;

        if let Some(reason) = parsed
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_ref())
        {
            return Err(CassandraError::Transport(TransportError::with_provider(
                TransportErrorKind::Fatal,
                format!("prompt blocked: {}", reason),
                PROVIDER,
            )));
        }

        let candidate = parsed.candidates.into_iter().next().ok_or_else(|| {
            CassandraError::Transport(TransportError::with_provider(
                TransportErrorKind::Transient,
                "No candidates in Gemini response",
                PROVIDER,
            ))
        })?;

        let text: String = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.is_empty() {
            warn!(label = %request.label, finish_reason = ?candidate.finish_reason, "Empty Gemini response");
        }

        let usage = parsed
            .usage_metadata
            .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();

        debug!(label = %request.label, chars = text.len(), "Received Gemini response");

        Ok(LlmResponse {
            text,
            usage,
            timing: ResponseTiming::from_duration(start_time.elapsed()),
            metadata: ResponseMetadata {
                model: self.model.clone(),
                provider: PROVIDER.to_string(),
                finish_reason: candidate.finish_reason,
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
        let url = format!(
            "{}/models/{}",
            self.api_base.as_str().trim_end_matches('/'),
            self.model
        );
        match self
            .client
            .get(&url)
            .header("x-goog-api-key", self.api_key.expose_secret())
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => Ok(true),
            Ok(resp) => {
                warn!("Gemini API check failed: {}", resp.status());
                Ok(false)
            }
            Err(e) => {
                warn!("Gemini API check failed: {}", e);
                Ok(false)
            }
        }
    }
}

// Request/Response types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}
