//! Pipeline state and the merge rules that govern it
//!
//! One `State` exists per invocation. Every accumulated field has exactly one
//! owning step; the merge refuses a second write or a write by anyone else.

use crate::config::Credentials;
use crate::error::{ErrorKind, OrchestrationError};
use crate::models::{ChartPlan, DatasetDescriptor, ExecutionResult, FilterSpec, StepName, TokenUsage};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One failure captured during a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    pub step: StepName,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(step: StepName, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            step,
            kind,
            message: message.into(),
        }
    }

    pub fn from_error(step: StepName, error: &OrchestrationError) -> Self {
        Self::new(step, error.kind(), error.detail())
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.step, self.kind, self.message)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Empty,
    Failed,
    Fatal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepRecord {
    pub step: StepName,
    pub status: StepStatus,
    /// Length of `errors` once this step was merged.
    pub errors_after: usize,
    pub usage: TokenUsage,
}

/// Written by the sequencer only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionMetadata {
    pub steps: Vec<StepRecord>,
    pub token_usage: TokenUsage,
}

impl ExecutionMetadata {
    pub fn ran(&self, step: StepName) -> bool {
        self.steps.iter().any(|r| r.step == step)
    }
}

/// Partial update returned by a step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub search_results: Option<Vec<DatasetDescriptor>>,
    pub chart_plan: Option<ChartPlan>,
    pub filters: Option<FilterSpec>,
    pub execution_result: Option<ExecutionResult>,
    pub final_response: Option<String>,
    pub errors: Vec<ErrorRecord>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct State {
    pub question: String,
    #[serde(skip)]
    pub credentials: Credentials,
    /// Extra instructions for the interpretation prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    pub search_results: Option<Vec<DatasetDescriptor>>,
    pub chart_plan: Option<ChartPlan>,
    pub filters: Option<FilterSpec>,
    pub execution_result: Option<ExecutionResult>,
    pub final_response: Option<String>,

    pub errors: Vec<ErrorRecord>,
    pub notes: Vec<String>,
    pub metadata: ExecutionMetadata,
}

impl State {
    pub fn new(question: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            question: question.into(),
            credentials,
            instructions: None,
            search_results: None,
            chart_plan: None,
            filters: None,
            execution_result: None,
            final_response: None,
            errors: Vec::new(),
            notes: Vec::new(),
            metadata: ExecutionMetadata::default(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        let instructions = instructions.into();
        if !instructions.trim().is_empty() {
            self.instructions = Some(instructions);
        }
        self
    }

    /// Pre-flight check run before any step.
    pub fn validate_initial(&self) -> Result<()> {
        if self.question.trim().is_empty() {
            return Err(OrchestrationError::ConfigurationError(
                "question must not be empty".to_string(),
            ));
        }
        self.credentials.validate()
    }

    /// Datasets found by Search, empty when Search has not produced any.
    pub fn datasets(&self) -> &[DatasetDescriptor] {
        self.search_results.as_deref().unwrap_or(&[])
    }

    /// Merge a step's partial update. `writer` must own every field it sets.
    pub fn merge(&mut self, writer: StepName, update: StateUpdate) -> Result<()> {
        let StateUpdate {
            search_results,
            chart_plan,
            filters,
            execution_result,
            final_response,
            errors,
            notes,
        } = update;

        // Validate everything first so a rejected update leaves no trace.
        check_write(writer, StepName::Search, "search_results", &self.search_results, &search_results)?;
        check_write(writer, StepName::Plan, "chart_plan", &self.chart_plan, &chart_plan)?;
        check_write(writer, StepName::Filter, "filters", &self.filters, &filters)?;
        check_write(writer, StepName::Execute, "execution_result", &self.execution_result, &execution_result)?;
        check_write(writer, StepName::Interpret, "final_response", &self.final_response, &final_response)?;

        if search_results.is_some() {
            self.search_results = search_results;
        }
        if chart_plan.is_some() {
            self.chart_plan = chart_plan;
        }
        if filters.is_some() {
            self.filters = filters;
        }
        if execution_result.is_some() {
            self.execution_result = execution_result;
        }
        if final_response.is_some() {
            self.final_response = final_response;
        }
        self.errors.extend(errors);
        self.notes.extend(notes);
        Ok(())
    }

    pub fn record_error(&mut self, record: ErrorRecord) {
        self.errors.push(record);
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn record_step(&mut self, step: StepName, status: StepStatus, usage: TokenUsage) {
        self.metadata.token_usage.add(usage);
        self.metadata.steps.push(StepRecord {
            step,
            status,
            errors_after: self.errors.len(),
            usage,
        });
    }
}

fn check_write<T>(
    writer: StepName,
    owner: StepName,
    field: &str,
    current: &Option<T>,
    incoming: &Option<T>,
) -> Result<()> {
    if incoming.is_none() {
        return Ok(());
    }
    if writer != owner {
        return Err(OrchestrationError::StateConflict(format!(
            "{} tried to write {}, which is owned by {}",
            writer, field, owner
        )));
    }
    if current.is_some() {
        return Err(OrchestrationError::StateConflict(format!(
            "{} is already set and cannot be overwritten",
            field
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> State {
        State::new("哪個縣市的交通事故最多？", Credentials::new("id", "secret", "sk-test"))
    }

    fn dataset(id: &str) -> DatasetDescriptor {
        DatasetDescriptor {
            id: id.to_string(),
            name: format!("dataset {}", id),
            description: String::new(),
            source_url: "https://planet.example".to_string(),
            site_name: None,
        }
    }

    #[test]
    fn test_validate_initial() {
        assert!(state().validate_initial().is_ok());

        let blank = State::new("  ", Credentials::new("id", "secret", "key"));
        assert!(matches!(
            blank.validate_initial(),
            Err(OrchestrationError::ConfigurationError(_))
        ));

        let no_creds = State::new("question", Credentials::default());
        assert!(matches!(
            no_creds.validate_initial(),
            Err(OrchestrationError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_merge_sets_owned_field() {
        let mut state = state();
        let update = StateUpdate {
            search_results: Some(vec![dataset("a")]),
            notes: vec!["found 1".to_string()],
            ..Default::default()
        };
        state.merge(StepName::Search, update).unwrap();
        assert_eq!(state.datasets().len(), 1);
        assert_eq!(state.notes, vec!["found 1".to_string()]);
    }

    #[test]
    fn test_merge_rejects_foreign_writer() {
        let mut state = state();
        let update = StateUpdate {
            final_response: Some("answer".to_string()),
            ..Default::default()
        };
        let err = state.merge(StepName::Plan, update).unwrap_err();
        assert!(matches!(err, OrchestrationError::StateConflict(_)));
        assert!(state.final_response.is_none());
    }

    #[test]
    fn test_merge_rejects_overwrite_and_leaves_state_untouched() {
        let mut state = state();
        state
            .merge(
                StepName::Search,
                StateUpdate {
                    search_results: Some(vec![dataset("a")]),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = state
            .merge(
                StepName::Search,
                StateUpdate {
                    search_results: Some(vec![dataset("b")]),
                    errors: vec![ErrorRecord::new(StepName::Search, ErrorKind::Upstream, "x")],
                    ..Default::default()
                },
            )
            .unwrap_err();

        assert!(err.to_string().contains("search_results"));
        assert_eq!(state.datasets()[0].id, "a");
        assert!(state.errors.is_empty());
    }

    #[test]
    fn test_errors_append_only() {
        let mut state = state();
        state.record_error(ErrorRecord::new(StepName::Search, ErrorKind::Upstream, "timeout"));
        state
            .merge(
                StepName::Interpret,
                StateUpdate {
                    errors: vec![ErrorRecord::new(StepName::Interpret, ErrorKind::LlmParse, "bad")],
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(state.errors.len(), 2);
        assert_eq!(state.errors[0].message, "timeout");
    }

    #[test]
    fn test_record_step_tracks_error_count() {
        let mut state = state();
        state.record_error(ErrorRecord::new(StepName::Search, ErrorKind::Upstream, "503"));
        state.record_step(
            StepName::Search,
            StepStatus::Failed,
            TokenUsage { prompt_tokens: 3, completion_tokens: 4 },
        );
        assert_eq!(state.metadata.steps[0].errors_after, 1);
        assert_eq!(state.metadata.token_usage.total(), 7);
        assert!(state.metadata.ran(StepName::Search));
    }

    #[test]
    fn test_serialization_skips_credentials() {
        let json = serde_json::to_string(&state()).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("sk-test"));
    }
}
