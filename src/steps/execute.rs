//! Execute: run the exploration queries and tabulate the rows

use super::{Setbacks, Step, StepContext, StepResult, Transition};
use crate::catalog::build_table;
use crate::error::OrchestrationError;
use crate::models::{ExecutionResult, ExplorationQuery, StepName};
use crate::retry::with_retry;
use crate::state::{State, StateUpdate};
use crate::Result;
use async_trait::async_trait;
use tracing::{info, warn};

pub struct ExecuteStep {
    ctx: StepContext,
}

impl ExecuteStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Step for ExecuteStep {
    fn name(&self) -> StepName {
        StepName::Execute
    }

    async fn execute(&self, state: &State) -> Result<StepResult> {
        let mut setbacks = Setbacks::default();
        let queries: Vec<ExplorationQuery> = match (&state.filters, &state.chart_plan) {
            (Some(filters), _) => filters.queries.clone(),
            (None, Some(plan)) => {
                setbacks.note("filters could not be decided; queries ran without filters");
                plan.charts.iter().map(ExplorationQuery::unfiltered).collect()
            }
            (None, None) => {
                return Err(OrchestrationError::EmptyResult("no queries to execute".to_string()));
            }
        };

        let config = &self.ctx.config;
        let deadline = config.timeout();
        let catalog = &self.ctx.catalog;
        let mut tables = Vec::with_capacity(queries.len());

        for query in &queries {
            let outcome = with_retry(&config.retry, deadline, "exploration", move || {
                catalog.explore(query, deadline)
            })
            .await;

            match outcome {
                Ok(rows) => tables.push(build_table(query, rows)),
                Err(e) if e.kind().is_fatal() => return Err(e),
                Err(e) => {
                    warn!(dataset_id = %query.dataset.id, error = %e, "Exploration failed");
                    setbacks.fail(format!("exploration of \"{}\" failed", query.dataset.name), e);
                }
            }
        }

        if tables.is_empty() {
            if let Some(last) = setbacks.take_last() {
                return setbacks.settle(self, Err(last));
            }
        }
        if tables.iter().all(|t| t.is_empty()) {
            let empty = OrchestrationError::EmptyResult("the queries returned no rows".to_string());
            return setbacks.settle(self, Err(empty));
        }

        let result = ExecutionResult { tables };
        info!(tables = result.tables.len(), rows = result.row_count(), "Exploration finished");

        let update = StateUpdate {
            execution_result: Some(result),
            ..Default::default()
        };
        setbacks.settle(self, Ok(StepResult::proceed(update)))
    }

    fn fallback(&self, _error: &OrchestrationError) -> Transition {
        Transition::SkipTo(StepName::Interpret)
    }
}
