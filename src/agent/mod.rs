//! Main orchestrator - runs the fixed step pipeline
//!
//! SEARCH → PLAN → FILTER → EXECUTE → INTERPRET
//!
//! Every step runs inside the same guard: its update is merged on success,
//! non-fatal failures are recorded and routed through the step's fallback,
//! fatal failures stop the run with no final response.

use crate::catalog::DataCatalog;
use crate::config::Config;
use crate::error::OrchestrationError;
use crate::llm::LlmClient;
use crate::models::StepName;
use crate::state::{ErrorRecord, State, StepStatus};
use crate::steps::{
    ExecuteStep, FilterStep, InterpretStep, PlanStep, SearchStep, Step, StepContext, StepResult,
    Transition,
};
use crate::Result;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

pub struct Orchestrator {
    config: Arc<Config>,
    steps: Vec<Box<dyn Step>>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, catalog: Arc<dyn DataCatalog>, llm: Arc<dyn LlmClient>) -> Self {
        let ctx = StepContext::new(config.clone(), catalog, llm);
        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(SearchStep::new(ctx.clone())),
            Box::new(PlanStep::new(ctx.clone())),
            Box::new(FilterStep::new(ctx.clone())),
            Box::new(ExecuteStep::new(ctx.clone())),
            Box::new(InterpretStep::new(ctx)),
        ];
        Self { config, steps }
    }

    /// Build with custom step implementations, run in the given order.
    pub fn with_steps(config: Arc<Config>, steps: Vec<Box<dyn Step>>) -> Self {
        Self { config, steps }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the pipeline to completion.
    ///
    /// Fails only when the initial state is unusable. Every other failure is
    /// recorded in the returned state.
    pub async fn run(&self, mut state: State) -> Result<State> {
        state.validate_initial()?;
        info!(question = %state.question, "Orchestrator: starting run");

        let mut index = 0;
        while let Some(step) = self.steps.get(index) {
            let name = step.name();
            let started = Instant::now();
            debug!(step = %name, "Running step");

            let transition = self.guard(step.as_ref(), &mut state).await;
            let transition = route_after(name, transition, &mut state);

            let status = state
                .metadata
                .steps
                .last()
                .map(|r| r.status)
                .unwrap_or(StepStatus::Completed);
            info!(
                step = %name,
                status = ?status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                errors = state.errors.len(),
                "Step finished"
            );

            match transition {
                Transition::Continue => index += 1,
                Transition::Halt => break,
                Transition::SkipTo(target) if target <= name => {
                    let defect = OrchestrationError::StateConflict(format!(
                        "{} tried to move back to {}",
                        name, target
                    ));
                    error!(step = %name, target = %target, "Backward transition rejected");
                    state.record_error(ErrorRecord::from_error(name, &defect));
                    break;
                }
                Transition::SkipTo(target) => {
                    match self.steps.iter().position(|s| s.name() == target) {
                        Some(position) => {
                            debug!(from = %name, to = %target, "Skipping ahead");
                            index = position;
                        }
                        None => break,
                    }
                }
            }
        }

        info!(
            answered = state.final_response.is_some(),
            errors = state.errors.len(),
            tokens = state.metadata.token_usage.total(),
            "Orchestrator: run finished"
        );
        Ok(state)
    }

    /// Run one step and fold its outcome into the state.
    async fn guard(&self, step: &dyn Step, state: &mut State) -> Transition {
        let name = step.name();
        let result = match step.execute(state).await {
            Ok(result) => result,
            Err(e) => StepResult::failure(step, e),
        };

        match state.merge(name, result.update) {
            Ok(()) => {
                state.record_step(name, result.status, result.usage);
                result.transition
            }
            Err(conflict) => {
                error!(step = %name, error = %conflict, "Step update rejected");
                state.record_error(ErrorRecord::from_error(name, &conflict));
                state.record_step(name, StepStatus::Fatal, result.usage);
                Transition::Halt
            }
        }
    }
}

/// Conditional routing: no datasets after Search means nothing to plan.
fn route_after(step: StepName, transition: Transition, state: &mut State) -> Transition {
    if step == StepName::Search && transition == Transition::Continue && state.datasets().is_empty() {
        state.add_note("no data found");
        return Transition::SkipTo(StepName::Interpret);
    }
    transition
}
