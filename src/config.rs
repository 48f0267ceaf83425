//! Runtime configuration
//!
//! Built once (from the environment or by hand in tests) and then shared
//! read-only as `Arc<Config>` by the orchestrator and every step.

use crate::error::OrchestrationError;
use crate::llm::LlmProvider;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_SSO_URL: &str = "https://sso.araliadata.io";
pub const DEFAULT_API_URL: &str = "https://tw-air.araliadata.io";

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20240620";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// Authentication payload for one invocation.
///
/// Debug output never prints the secrets.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub catalog_client_id: String,
    pub catalog_client_secret: String,
    pub llm_api_key: String,
}

impl Credentials {
    pub fn new(
        catalog_client_id: impl Into<String>,
        catalog_client_secret: impl Into<String>,
        llm_api_key: impl Into<String>,
    ) -> Self {
        Self {
            catalog_client_id: catalog_client_id.into(),
            catalog_client_secret: catalog_client_secret.into(),
            llm_api_key: llm_api_key.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("catalog_client_id", &self.catalog_client_id),
            ("catalog_client_secret", &self.catalog_client_secret),
            ("llm_api_key", &self.llm_api_key),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestrationError::ConfigurationError(format!(
                "Missing required credentials: {}",
                missing.join(", ")
            )))
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("catalog_client_id", &self.catalog_client_id)
            .field("catalog_client_secret", &"***")
            .field("llm_api_key", &"***")
            .finish()
    }
}

/// Per-request overrides of the environment credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialOverrides {
    pub catalog_client_id: Option<String>,
    pub catalog_client_secret: Option<String>,
    pub llm_api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogConfig {
    pub sso_url: String,
    pub api_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub page_size: u32,
    /// Re-authenticate once when a request comes back 401 instead of failing.
    pub reauth_on_expiry: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            sso_url: DEFAULT_SSO_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            client_id: None,
            client_secret: None,
            page_size: 50,
            reauth_on_expiry: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub provider: Option<LlmProvider>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub openai_base_url: String,
    pub anthropic_base_url: String,
    pub gemini_base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: None,
            api_key: None,
            model: None,
            temperature: 0.0,
            max_output_tokens: 4096,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            anthropic_base_url: "https://api.anthropic.com/v1".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }
}

impl LlmConfig {
    /// Provider for a key: explicit setting first, then key prefix.
    pub fn provider_for(&self, api_key: &str) -> LlmProvider {
        self.provider
            .unwrap_or_else(|| LlmProvider::infer_from_key(api_key))
    }

    pub fn model_for(&self, provider: LlmProvider) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match provider {
            LlmProvider::OpenAi => DEFAULT_OPENAI_MODEL,
            LlmProvider::Anthropic => DEFAULT_ANTHROPIC_MODEL,
            LlmProvider::Gemini => DEFAULT_GEMINI_MODEL,
        }
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one for upstream failures.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Corrective re-prompts after an unparseable structured answer.
    pub llm_parse_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            llm_parse_retries: 1,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub catalog: CatalogConfig,
    pub llm: LlmConfig,
    pub retry: RetryPolicy,
    pub timeout_seconds: u64,
    pub log_level: String,
    pub verbose: bool,
    /// Let the LLM narrow the raw search hits down to the relevant datasets.
    pub dataset_selection: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig::default(),
            llm: LlmConfig::default(),
            retry: RetryPolicy::default(),
            timeout_seconds: 30,
            log_level: "info".to_string(),
            verbose: false,
            dataset_selection: true,
        }
    }
}

impl Config {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(url) = get("ARALIA_SSO_URL") {
            config.catalog.sso_url = url;
        }
        if let Some(url) = get("ARALIA_API_URL").or_else(|| get("ARALIA_STELLAR_URL")) {
            config.catalog.api_url = url;
        }
        config.catalog.client_id = get("ARALIA_CLIENT_ID");
        config.catalog.client_secret = get("ARALIA_CLIENT_SECRET");
        if let Some(v) = get("ARALIA_PAGE_SIZE") {
            config.catalog.page_size = parse_value("ARALIA_PAGE_SIZE", &v)?;
        }
        if let Some(v) = get("REAUTH_ON_EXPIRY") {
            config.catalog.reauth_on_expiry = parse_bool("REAUTH_ON_EXPIRY", &v)?;
        }

        if let Some(v) = get("LLM_PROVIDER") {
            config.llm.provider = Some(v.parse()?);
        }
        config.llm.api_key = get("LLM_API_KEY")
            .or_else(|| get("OPENAI_API_KEY"))
            .or_else(|| get("ANTHROPIC_API_KEY"))
            .or_else(|| get("GEMINI_API_KEY"))
            .or_else(|| get("GOOGLE_API_KEY"));
        config.llm.model = get("LLM_MODEL");
        if let Some(v) = get("TEMPERATURE") {
            config.llm.temperature = parse_value("TEMPERATURE", &v)?;
        }
        if let Some(url) = get("OPENAI_BASE_URL") {
            config.llm.openai_base_url = url;
        }
        if let Some(url) = get("ANTHROPIC_BASE_URL") {
            config.llm.anthropic_base_url = url;
        }
        if let Some(url) = get("GEMINI_BASE_URL") {
            config.llm.gemini_base_url = url;
        }

        if let Some(v) = get("MAX_RETRIES") {
            config.retry.max_retries = parse_value("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("TIMEOUT_SECONDS") {
            config.timeout_seconds = parse_value("TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            config.log_level = v.to_lowercase();
        }
        if let Some(v) = get("VERBOSE") {
            config.verbose = parse_bool("VERBOSE", &v)?;
        }
        if let Some(v) = get("DATASET_SELECTION") {
            config.dataset_selection = parse_bool("DATASET_SELECTION", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Sanity checks on the numeric knobs.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_seconds == 0 {
            return Err(OrchestrationError::ConfigurationError(
                "TIMEOUT_SECONDS must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(OrchestrationError::ConfigurationError(format!(
                "TEMPERATURE must be within 0.0..=2.0, got {}",
                self.llm.temperature
            )));
        }
        if self.catalog.page_size == 0 {
            return Err(OrchestrationError::ConfigurationError(
                "ARALIA_PAGE_SIZE must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Copy of this config with per-request knobs applied.
    pub fn with_overrides(
        &self,
        temperature: Option<f32>,
        max_retries: Option<u32>,
        timeout_seconds: Option<u64>,
    ) -> Result<Config> {
        let mut config = self.clone();
        if let Some(t) = temperature {
            config.llm.temperature = t;
        }
        if let Some(r) = max_retries {
            config.retry.max_retries = r;
        }
        if let Some(s) = timeout_seconds {
            config.timeout_seconds = s;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Credentials from the environment, patched with request overrides.
    pub fn resolve_credentials(&self, overrides: Option<&CredentialOverrides>) -> Result<Credentials> {
        let pick = |over: Option<&String>, base: &Option<String>| {
            over.cloned()
                .or_else(|| base.clone())
                .unwrap_or_default()
        };
        let overrides = overrides.cloned().unwrap_or_default();

        let credentials = Credentials {
            catalog_client_id: pick(overrides.catalog_client_id.as_ref(), &self.catalog.client_id),
            catalog_client_secret: pick(
                overrides.catalog_client_secret.as_ref(),
                &self.catalog.client_secret,
            ),
            llm_api_key: pick(overrides.llm_api_key.as_ref(), &self.llm.api_key),
        };
        credentials.validate()?;
        Ok(credentials)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        OrchestrationError::ConfigurationError(format!("Invalid value for {}: {:?}", key, raw))
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(OrchestrationError::ConfigurationError(format!(
            "Invalid boolean for {}: {:?}",
            key, raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.catalog.sso_url, DEFAULT_SSO_URL);
        assert_eq!(config.catalog.api_url, DEFAULT_API_URL);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.llm.temperature, 0.0);
        assert!(config.dataset_selection);
        assert!(config.catalog.reauth_on_expiry);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("ARALIA_CLIENT_ID", "id"),
            ("ARALIA_CLIENT_SECRET", "secret"),
            ("GEMINI_API_KEY", "AIza-test"),
            ("MAX_RETRIES", "5"),
            ("TIMEOUT_SECONDS", "10"),
            ("VERBOSE", "true"),
            ("LOG_LEVEL", "DEBUG"),
        ]))
        .unwrap();

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert!(config.verbose);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.llm.api_key.as_deref(), Some("AIza-test"));
    }

    #[test]
    fn test_invalid_number_is_configuration_error() {
        let err = Config::from_lookup(lookup(&[("MAX_RETRIES", "many")])).unwrap_err();
        assert!(matches!(err, OrchestrationError::ConfigurationError(_)));
    }

    #[test]
    fn test_missing_credentials() {
        let config = Config::from_lookup(lookup(&[("ARALIA_CLIENT_ID", "id")])).unwrap();
        let err = config.resolve_credentials(None).unwrap_err();
        assert!(err.to_string().contains("catalog_client_secret"));
        assert!(err.to_string().contains("llm_api_key"));
    }

    #[test]
    fn test_request_overrides_win() {
        let config = Config::from_lookup(lookup(&[
            ("ARALIA_CLIENT_ID", "env-id"),
            ("ARALIA_CLIENT_SECRET", "env-secret"),
            ("LLM_API_KEY", "sk-env"),
        ]))
        .unwrap();
        let overrides = CredentialOverrides {
            llm_api_key: Some("sk-ant-request".to_string()),
            ..Default::default()
        };

        let creds = config.resolve_credentials(Some(&overrides)).unwrap();
        assert_eq!(creds.catalog_client_id, "env-id");
        assert_eq!(creds.llm_api_key, "sk-ant-request");
    }

    #[test]
    fn test_credentials_debug_redacts_secrets() {
        let creds = Credentials::new("id", "top-secret", "sk-key");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("top-secret"));
        assert!(!printed.contains("sk-key"));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            llm_parse_retries: 1,
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(350));
    }

    #[test]
    fn test_overrides_are_validated() {
        let base = Config::default();
        let tuned = base.with_overrides(Some(0.7), Some(1), None).unwrap();
        assert_eq!(tuned.retry.max_retries, 1);
        assert_eq!(tuned.timeout_seconds, base.timeout_seconds);

        assert!(base.with_overrides(None, None, Some(0)).is_err());
        assert!(base.with_overrides(Some(3.5), None, None).is_err());
    }

    #[test]
    fn test_model_defaults_follow_provider() {
        let llm = LlmConfig::default();
        assert_eq!(llm.model_for(LlmProvider::Gemini), DEFAULT_GEMINI_MODEL);
        assert_eq!(llm.provider_for("sk-ant-xyz"), LlmProvider::Anthropic);
    }
}
