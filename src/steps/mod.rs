//! Pipeline steps
//!
//! Each step reads the state, talks to its collaborators and returns a
//! partial update. Steps never mutate the state themselves; the sequencer
//! merges what they return.

use crate::catalog::DataCatalog;
use crate::config::Config;
use crate::error::{ErrorKind, OrchestrationError};
use crate::llm::{LlmClient, LlmRequest, OutputSchema, PromptKind};
use crate::models::{StepName, TokenUsage};
use crate::prompts;
use crate::retry::with_retry;
use crate::state::{ErrorRecord, State, StateUpdate, StepStatus};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};

pub mod execute;
pub mod filter;
pub mod interpret;
pub mod plan;
pub mod search;

pub use execute::ExecuteStep;
pub use filter::FilterStep;
pub use interpret::InterpretStep;
pub use plan::PlanStep;
pub use search::SearchStep;

/// Where the sequencer goes after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Continue,
    Halt,
    /// Jump forward to the named step.
    SkipTo(StepName),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub update: StateUpdate,
    pub transition: Transition,
    pub usage: TokenUsage,
    pub status: StepStatus,
}

impl StepResult {
    pub fn proceed(update: StateUpdate) -> Self {
        Self {
            update,
            transition: Transition::Continue,
            usage: TokenUsage::default(),
            status: StepStatus::Completed,
        }
    }

    /// Outcome of a failed step.
    ///
    /// An empty result leaves a note, a fatal error halts the run, and any
    /// other failure is recorded before taking the step's fallback.
    pub fn failure<S: Step + ?Sized>(step: &S, err: OrchestrationError) -> Self {
        let name = step.name();
        let mut update = StateUpdate::default();

        let (status, transition) = match err.kind() {
            ErrorKind::EmptyResult => {
                info!(step = %name, reason = %err.detail(), "Step found no data");
                update.notes.push(err.detail());
                (StepStatus::Empty, step.fallback(&err))
            }
            kind if kind.is_fatal() => {
                error!(step = %name, error = %err, "Fatal step failure, halting");
                update.errors.push(ErrorRecord::from_error(name, &err));
                (StepStatus::Fatal, Transition::Halt)
            }
            _ => {
                warn!(step = %name, error = %err, "Step failed, applying fallback");
                update.errors.push(ErrorRecord::from_error(name, &err));
                (StepStatus::Failed, step.fallback(&err))
            }
        };

        Self {
            update,
            transition,
            usage: TokenUsage::default(),
            status,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// Failures a step absorbed while carrying on with the rest of its work.
#[derive(Debug, Default)]
pub struct Setbacks {
    failures: Vec<OrchestrationError>,
    notes: Vec<String>,
}

impl Setbacks {
    /// Keep `err`, prefixed with what was being attempted.
    pub fn fail(&mut self, context: impl std::fmt::Display, err: OrchestrationError) {
        let detail = format!("{}: {}", context, err.detail());
        self.failures.push(OrchestrationError::from_kind(err.kind(), detail));
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Take back the most recent failure.
    pub fn take_last(&mut self) -> Option<OrchestrationError> {
        self.failures.pop()
    }

    fn is_empty(&self) -> bool {
        self.failures.is_empty() && self.notes.is_empty()
    }

    /// Fold the absorbed failures and notes into the step's outcome.
    ///
    /// They come before the outcome's own records. A failed outcome is
    /// turned into a failed `StepResult` so nothing absorbed is lost; with
    /// nothing absorbed it is returned unchanged.
    pub fn settle<S: Step + ?Sized>(self, step: &S, outcome: Result<StepResult>) -> Result<StepResult> {
        if self.is_empty() {
            return outcome;
        }

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => StepResult::failure(step, e),
        };

        let name = step.name();
        let records: Vec<ErrorRecord> = self
            .failures
            .iter()
            .map(|e| ErrorRecord::from_error(name, e))
            .collect();
        result.update.errors.splice(0..0, records);
        result.update.notes.splice(0..0, self.notes);
        Ok(result)
    }
}

#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> StepName;

    async fn execute(&self, state: &State) -> Result<StepResult>;

    /// Transition taken when `execute` fails with a non-fatal error.
    ///
    /// Steps that absorbed failures before failing hand back a failed
    /// `StepResult` instead of an error; see [`Setbacks::settle`].
    fn fallback(&self, error: &OrchestrationError) -> Transition;
}

/// Collaborators shared by every step.
#[derive(Clone)]
pub struct StepContext {
    pub config: Arc<Config>,
    pub catalog: Arc<dyn DataCatalog>,
    pub llm: Arc<dyn LlmClient>,
}

impl StepContext {
    pub fn new(config: Arc<Config>, catalog: Arc<dyn DataCatalog>, llm: Arc<dyn LlmClient>) -> Self {
        Self { config, catalog, llm }
    }

    pub fn request(&self, kind: PromptKind, system: &str, prompt: String) -> LlmRequest {
        LlmRequest::new(kind, prompt)
            .with_system(system)
            .with_temperature(self.config.llm.temperature)
    }

    /// Ask for structured output and convert it with `parse`.
    ///
    /// Upstream failures are retried with backoff. A parse failure (either
    /// schema validation or `parse` itself) triggers a corrective re-prompt,
    /// up to `llm_parse_retries` times.
    pub async fn complete_structured<T, F>(
        &self,
        request: LlmRequest,
        schema: &OutputSchema,
        parse: F,
    ) -> Result<(T, TokenUsage)>
    where
        F: Fn(&Value) -> Result<T> + Send + Sync,
    {
        let original_prompt = request.prompt.clone();
        let mut current = request;
        let mut usage = TokenUsage::default();
        let mut corrections = 0;
        let operation = format!("{:?} completion", current.kind);

        loop {
            let llm = &self.llm;
            let attempt = &current;
            let outcome = with_retry(&self.config.retry, self.config.timeout(), &operation, move || {
                llm.complete(attempt, schema)
            })
            .await;

            let parsed = match outcome {
                Ok(output) => {
                    usage.add(output.usage);
                    parse(&output.value)
                }
                Err(e) => Err(e),
            };

            match parsed {
                Ok(value) => return Ok((value, usage)),
                Err(OrchestrationError::LlmParseError(problem))
                    if corrections < self.config.retry.llm_parse_retries =>
                {
                    warn!(kind = ?current.kind, problem = %problem, "Structured output rejected, re-prompting");
                    corrections += 1;
                    current.prompt = prompts::corrective(&original_prompt, &problem);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Rejects a structured answer; triggers the corrective re-prompt.
pub(crate) fn parse_error(message: impl Into<String>) -> OrchestrationError {
    OrchestrationError::LlmParseError(message.into())
}

/// String form of a JSON scalar, `None` for anything else.
pub(crate) fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
