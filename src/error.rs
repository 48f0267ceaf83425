//! Error types for the data-question orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Pipeline Failure Taxonomy
    // =============================

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("No data: {0}")]
    EmptyResult(String),

    #[error("LLM output could not be parsed: {0}")]
    LlmParseError(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Failure class recorded in the pipeline state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Auth,
    Upstream,
    EmptyResult,
    LlmParse,
    Internal,
}

impl ErrorKind {
    /// Fatal kinds abort the whole invocation.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::Configuration | ErrorKind::Auth | ErrorKind::Internal
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Auth => "AuthError",
            ErrorKind::Upstream => "UpstreamError",
            ErrorKind::EmptyResult => "EmptyResultError",
            ErrorKind::LlmParse => "LLMParseError",
            ErrorKind::Internal => "InternalError",
        };
        f.write_str(label)
    }
}

impl OrchestrationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrationError::ConfigurationError(_) => ErrorKind::Configuration,
            OrchestrationError::AuthError(_) => ErrorKind::Auth,
            OrchestrationError::UpstreamError(_)
            | OrchestrationError::HttpError(_)
            | OrchestrationError::SerializationError(_) => ErrorKind::Upstream,
            OrchestrationError::EmptyResult(_) => ErrorKind::EmptyResult,
            OrchestrationError::LlmParseError(_) => ErrorKind::LlmParse,
            OrchestrationError::StateConflict(_) | OrchestrationError::IoError(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// The message without the variant prefix.
    pub fn detail(&self) -> String {
        match self {
            OrchestrationError::ConfigurationError(m)
            | OrchestrationError::AuthError(m)
            | OrchestrationError::UpstreamError(m)
            | OrchestrationError::EmptyResult(m)
            | OrchestrationError::LlmParseError(m)
            | OrchestrationError::StateConflict(m) => m.clone(),
            OrchestrationError::SerializationError(e) => e.to_string(),
            OrchestrationError::HttpError(e) => e.to_string(),
            OrchestrationError::IoError(e) => e.to_string(),
        }
    }

    /// Rebuild an error from a recorded kind and detail.
    pub fn from_kind(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            ErrorKind::Configuration => OrchestrationError::ConfigurationError(detail),
            ErrorKind::Auth => OrchestrationError::AuthError(detail),
            ErrorKind::Upstream => OrchestrationError::UpstreamError(detail),
            ErrorKind::EmptyResult => OrchestrationError::EmptyResult(detail),
            ErrorKind::LlmParse => OrchestrationError::LlmParseError(detail),
            ErrorKind::Internal => OrchestrationError::StateConflict(detail),
        }
    }

    /// Whether the call that produced this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestrationError::UpstreamError(_) => true,
            OrchestrationError::HttpError(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map_or(true, |s| s.is_server_error() || s.as_u16() == 429)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            OrchestrationError::AuthError("denied".into()).kind(),
            ErrorKind::Auth
        );
        assert_eq!(
            OrchestrationError::StateConflict("chart_plan".into()).kind(),
            ErrorKind::Internal
        );
        let parse = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(OrchestrationError::from(parse).kind(), ErrorKind::Upstream);
    }

    #[test]
    fn test_retryable_only_for_upstream() {
        assert!(OrchestrationError::UpstreamError("503".into()).is_retryable());
        assert!(!OrchestrationError::AuthError("401".into()).is_retryable());
        assert!(!OrchestrationError::LlmParseError("bad json".into()).is_retryable());
        assert!(!OrchestrationError::EmptyResult("none".into()).is_retryable());
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(ErrorKind::Auth.is_fatal());
        assert!(ErrorKind::Configuration.is_fatal());
        assert!(!ErrorKind::Upstream.is_fatal());
        assert!(!ErrorKind::LlmParse.is_fatal());
        assert_eq!(ErrorKind::LlmParse.to_string(), "LLMParseError");
    }

    #[test]
    fn test_detail_round_trips_through_kind() {
        let original = OrchestrationError::AuthError("token rejected".into());
        let rebuilt = OrchestrationError::from_kind(original.kind(), original.detail());
        assert_eq!(rebuilt.to_string(), original.to_string());
    }
}
