//! LLM client abstraction
//!
//! Every provider implements [`LlmClient::generate`] (prompt in, raw text
//! out). [`LlmClient::complete`] layers JSON extraction and schema validation
//! on top, so a malformed answer surfaces as `LlmParseError` instead of a
//! silent best-effort guess.

use crate::config::LlmConfig;
use crate::error::OrchestrationError;
use crate::models::TokenUsage;
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub mod anthropic;
pub mod gemini;
pub mod mock;
pub mod openai;
pub mod schema;

pub use anthropic::AnthropicClient;
pub use gemini::GeminiClient;
pub use mock::MockLlm;
pub use openai::OpenAiClient;
pub use schema::{extract_json, FieldSpec, OutputSchema, SchemaType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Gemini,
}

impl LlmProvider {
    /// Guess the provider from the shape of an API key.
    pub fn infer_from_key(api_key: &str) -> Self {
        if api_key.starts_with("sk-ant-") {
            LlmProvider::Anthropic
        } else if api_key.starts_with("AIza") {
            LlmProvider::Gemini
        } else {
            LlmProvider::OpenAi
        }
    }
}

impl FromStr for LlmProvider {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "gpt" => Ok(LlmProvider::OpenAi),
            "anthropic" | "claude" => Ok(LlmProvider::Anthropic),
            "gemini" | "google" => Ok(LlmProvider::Gemini),
            other => Err(OrchestrationError::ConfigurationError(format!(
                "Unknown LLM provider: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Gemini => "gemini",
        };
        f.write_str(name)
    }
}

/// What a prompt is for. Lets test doubles script answers per purpose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    DatasetSelection,
    ChartPlan,
    FilterDecision,
    Interpretation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub kind: PromptKind,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: f32,
}

impl LlmRequest {
    pub fn new(kind: PromptKind, prompt: impl Into<String>) -> Self {
        Self {
            kind,
            system: None,
            prompt: prompt.into(),
            temperature: 0.0,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// A schema-validated JSON answer.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredOutput {
    pub value: Value,
    pub usage: TokenUsage,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> LlmProvider;

    /// Send the prompt and return the raw completion text.
    async fn generate(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Send the prompt and return JSON that satisfies `schema`.
    async fn complete(&self, request: &LlmRequest, schema: &OutputSchema) -> Result<StructuredOutput> {
        let response = self.generate(request).await?;
        let value = extract_json(&response.content).ok_or_else(|| {
            OrchestrationError::LlmParseError(format!(
                "no JSON object found in {} response",
                self.provider()
            ))
        })?;
        schema
            .validate(&value)
            .map_err(OrchestrationError::LlmParseError)?;

        Ok(StructuredOutput {
            value,
            usage: response.usage,
        })
    }
}

/// Build the provider client for an API key on top of a shared HTTP client.
///
/// `timeout` bounds each request; the connection pool belongs to `http`.
pub fn create_llm_client(
    http: Client,
    config: &LlmConfig,
    api_key: &str,
    timeout: Duration,
) -> Arc<dyn LlmClient> {
    let provider = config.provider_for(api_key);
    let model = config.model_for(provider);

    match provider {
        LlmProvider::OpenAi => Arc::new(OpenAiClient::new(
            http,
            config.openai_base_url.clone(),
            api_key.to_string(),
            model,
            config.max_output_tokens,
        )
        .with_timeout(timeout)),
        LlmProvider::Anthropic => Arc::new(AnthropicClient::new(
            http,
            config.anthropic_base_url.clone(),
            api_key.to_string(),
            model,
            config.max_output_tokens,
        )
        .with_timeout(timeout)),
        LlmProvider::Gemini => Arc::new(GeminiClient::new(
            http,
            config.gemini_base_url.clone(),
            api_key.to_string(),
            model,
            config.max_output_tokens,
        )
        .with_timeout(timeout)),
    }
}

/// Map a non-success provider status into the error taxonomy.
pub(crate) fn status_error(provider: LlmProvider, status: StatusCode, body: &str) -> OrchestrationError {
    match status.as_u16() {
        401 | 403 => OrchestrationError::AuthError(format!(
            "{} rejected the API key ({})",
            provider, status
        )),
        _ => OrchestrationError::UpstreamError(format!(
            "{} API returned {}: {}",
            provider,
            status,
            truncate(body, 300)
        )),
    }
}

pub(crate) fn transport_error(provider: LlmProvider, e: reqwest::Error) -> OrchestrationError {
    OrchestrationError::UpstreamError(format!("{} request failed: {}", provider, e))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}…", cut)
    }
}
