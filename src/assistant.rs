//! Single entry point for answering a question
//!
//! Resolves credentials and per-request overrides, builds the clients, runs
//! the orchestrator and shapes the response.

use crate::agent::Orchestrator;
use crate::audit::compute_state_digest;
use crate::catalog::{AraliaClient, DataCatalog};
use crate::config::{Config, CredentialOverrides, Credentials};
use crate::error::OrchestrationError;
use crate::llm::{self, LlmClient};
use crate::models::TokenUsage;
use crate::state::{ErrorRecord, State, StepRecord};
use crate::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub credentials: Option<CredentialOverrides>,
    /// Replaces the default answer-writing instructions.
    #[serde(default)]
    pub interpretation_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl AskRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub run_id: Uuid,
    pub question: String,
    pub final_response: String,
    pub errors: Vec<ErrorRecord>,
    pub notes: Vec<String>,
    pub steps: Vec<StepRecord>,
    pub token_usage: TokenUsage,
    /// SHA256 of the final state.
    pub digest: String,
}

/// Builds the external clients for one invocation.
pub trait ClientFactory: Send + Sync {
    fn catalog(&self, config: &Config, credentials: &Credentials) -> Result<Arc<dyn DataCatalog>>;
    fn llm(&self, config: &Config, credentials: &Credentials) -> Result<Arc<dyn LlmClient>>;
}

/// HTTP clients sharing one connection pool across invocations.
pub struct HttpClientFactory {
    http: Client,
}

impl HttpClientFactory {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .map_err(|e| OrchestrationError::ConfigurationError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }
}

impl ClientFactory for HttpClientFactory {
    fn catalog(&self, config: &Config, credentials: &Credentials) -> Result<Arc<dyn DataCatalog>> {
        Ok(Arc::new(AraliaClient::new(self.http.clone(), &config.catalog, credentials)))
    }

    fn llm(&self, config: &Config, credentials: &Credentials) -> Result<Arc<dyn LlmClient>> {
        Ok(llm::create_llm_client(
            self.http.clone(),
            &config.llm,
            &credentials.llm_api_key,
            config.timeout(),
        ))
    }
}

/// Hands out the same pre-built clients every time.
pub struct FixedClients {
    pub catalog: Arc<dyn DataCatalog>,
    pub llm: Arc<dyn LlmClient>,
}

impl ClientFactory for FixedClients {
    fn catalog(&self, _config: &Config, _credentials: &Credentials) -> Result<Arc<dyn DataCatalog>> {
        Ok(self.catalog.clone())
    }

    fn llm(&self, _config: &Config, _credentials: &Credentials) -> Result<Arc<dyn LlmClient>> {
        Ok(self.llm.clone())
    }
}

pub struct Assistant {
    config: Arc<Config>,
    factory: Arc<dyn ClientFactory>,
}

impl Assistant {
    pub fn new(config: Arc<Config>, factory: Arc<dyn ClientFactory>) -> Self {
        Self { config, factory }
    }

    /// Assistant backed by the real HTTP clients.
    pub fn from_config(config: Config) -> Result<Self> {
        Ok(Self::new(Arc::new(config), Arc::new(HttpClientFactory::new()?)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Answer one question.
    ///
    /// Returns `Err` for unusable input and for fatal failures (auth,
    /// configuration, internal defects). Recoverable failures still produce
    /// an answer and are listed in `errors`.
    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse> {
        let config = Arc::new(self.config.with_overrides(
            request.temperature,
            request.max_retries,
            request.timeout_seconds,
        )?);
        let credentials = config.resolve_credentials(request.credentials.as_ref())?;

        let run_id = Uuid::new_v4();
        info!(%run_id, question = %request.question, "Handling question");

        let catalog = self.factory.catalog(&config, &credentials)?;
        let llm = self.factory.llm(&config, &credentials)?;
        let orchestrator = Orchestrator::new(config, catalog, llm);

        let mut state = State::new(request.question, credentials);
        if let Some(prompt) = request.interpretation_prompt {
            state = state.with_instructions(prompt);
        }

        let state = orchestrator.run(state).await?;

        if let Some(fatal) = state.errors.iter().find(|e| e.kind.is_fatal()) {
            warn!(%run_id, step = %fatal.step, kind = %fatal.kind, "Run aborted");
            return Err(OrchestrationError::from_kind(fatal.kind, fatal.message.clone()));
        }

        let digest = compute_state_digest(&state);
        let final_response = state.final_response.clone().ok_or_else(|| {
            OrchestrationError::StateConflict("run finished without a final response".to_string())
        })?;

        info!(
            %run_id,
            errors = state.errors.len(),
            tokens = state.metadata.token_usage.total(),
            "Question answered"
        );

        Ok(AskResponse {
            run_id,
            question: state.question,
            final_response,
            errors: state.errors,
            notes: state.notes,
            steps: state.metadata.steps,
            token_usage: state.metadata.token_usage,
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogOperation, MockCatalog};
    use crate::error::ErrorKind;
    use crate::llm::MockLlm;

    fn config() -> Config {
        let mut config = Config::default();
        config.catalog.client_id = Some("id".to_string());
        config.catalog.client_secret = Some("secret".to_string());
        config.llm.api_key = Some("sk-test".to_string());
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 2;
        config
    }

    fn assistant(catalog: MockCatalog, llm: MockLlm) -> Assistant {
        Assistant::new(
            Arc::new(config()),
            Arc::new(FixedClients {
                catalog: Arc::new(catalog),
                llm: Arc::new(llm),
            }),
        )
    }

    #[tokio::test]
    async fn test_missing_credentials_rejected() {
        let assistant = Assistant::new(
            Arc::new(Config::default()),
            Arc::new(FixedClients {
                catalog: Arc::new(MockCatalog::new()),
                llm: Arc::new(MockLlm::new()),
            }),
        );
        let err = assistant.ask(AskRequest::new("question")).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_no_data_answer() {
        let response = assistant(MockCatalog::new(), MockLlm::new())
            .ask(AskRequest::new("Where do most accidents happen?"))
            .await
            .unwrap();

        assert!(response.final_response.contains("no relevant datasets"));
        assert!(response.errors.is_empty());
        assert_eq!(response.digest.len(), 64);
    }

    #[tokio::test]
    async fn test_auth_failure_is_error() {
        let catalog = MockCatalog::new().with_failures(CatalogOperation::Search, ErrorKind::Auth, 1);
        let err = assistant(catalog, MockLlm::new())
            .ask(AskRequest::new("question"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::AuthError(_)));
    }

    #[tokio::test]
    async fn test_invalid_override_rejected() {
        let request = AskRequest {
            timeout_seconds: Some(0),
            ..AskRequest::new("question")
        };
        let err = assistant(MockCatalog::new(), MockLlm::new())
            .ask(request)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ConfigurationError(_)));
    }
}
