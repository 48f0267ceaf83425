//! Filter: choose operators and values for the planned filter columns

use super::{parse_error, scalar_string, Setbacks, Step, StepContext, StepResult, Transition};
use crate::error::OrchestrationError;
use crate::llm::{FieldSpec, OutputSchema, PromptKind, SchemaType};
use crate::models::{ChartPlan, ChartSpec, ExplorationQuery, FilterColumn, FilterSpec, StepName};
use crate::prompts::{self, OPERATORS};
use crate::retry::with_retry;
use crate::state::{State, StateUpdate};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Candidate values shown to the model per column.
const MAX_OPTIONS_IN_PROMPT: usize = 200;

pub struct FilterStep {
    ctx: StepContext,
}

impl FilterStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }

    fn schema() -> OutputSchema {
        let decision = SchemaType::Object(vec![
            FieldSpec::required("columnID", SchemaType::String),
            FieldSpec::optional("operator", SchemaType::String),
            FieldSpec::optional("value", SchemaType::Any),
        ]);
        OutputSchema::object(vec![FieldSpec::required(
            "queries",
            SchemaType::Array(Box::new(SchemaType::Object(vec![
                FieldSpec::required("id", SchemaType::String),
                FieldSpec::optional("filter", SchemaType::Array(Box::new(decision))),
            ]))),
        )])
    }

    async fn options_for(
        &self,
        chart: &ChartSpec,
        column: &FilterColumn,
        setbacks: &mut Setbacks,
    ) -> Result<Vec<String>> {
        let config = &self.ctx.config;
        let deadline = config.timeout();
        let catalog = &self.ctx.catalog;
        let dataset = &chart.dataset;

        match with_retry(&config.retry, deadline, "filter options", move || {
            catalog.filter_options(dataset, column, deadline)
        })
        .await
        {
            Ok(values) => Ok(values),
            Err(e) if e.kind().is_fatal() => Err(e),
            Err(e) => {
                warn!(
                    dataset_id = %dataset.id,
                    column = %column.column.column_id,
                    error = %e,
                    "Filter options unavailable"
                );
                let context = format!(
                    "options for \"{}\" in \"{}\" could not be retrieved",
                    column.column.label(),
                    dataset.name
                );
                setbacks.fail(context, e);
                Ok(Vec::new())
            }
        }
    }

    /// Per chart, the filter columns with their candidate values.
    async fn candidates(&self, plan: &ChartPlan, setbacks: &mut Setbacks) -> Result<Value> {
        let mut queries = Vec::new();
        for chart in &plan.charts {
            let mut columns = Vec::new();
            for column in &chart.filter {
                let mut options = self.options_for(chart, column, setbacks).await?;
                options.truncate(MAX_OPTIONS_IN_PROMPT);
                columns.push(json!({
                    "columnID": column.column.column_id,
                    "displayName": column.column.label(),
                    "type": column.column.kind,
                    "format": column.format,
                    "options": options,
                }));
            }
            queries.push(json!({ "id": chart.dataset.id, "filter": columns }));
        }
        Ok(Value::Array(queries))
    }
}

#[async_trait]
impl Step for FilterStep {
    fn name(&self) -> StepName {
        StepName::Filter
    }

    async fn execute(&self, state: &State) -> Result<StepResult> {
        let plan = state
            .chart_plan
            .as_ref()
            .ok_or_else(|| OrchestrationError::EmptyResult("no chart plan to filter".to_string()))?;

        if plan.charts.iter().all(|c| c.filter.is_empty()) {
            debug!("Chart plan has no filter columns");
            let queries = plan.charts.iter().map(ExplorationQuery::unfiltered).collect();
            let update = StateUpdate {
                filters: Some(FilterSpec { queries }),
                ..Default::default()
            };
            return Ok(StepResult::proceed(update));
        }

        let mut setbacks = Setbacks::default();
        let candidates = self.candidates(plan, &mut setbacks).await?;
        let request = self.ctx.request(
            PromptKind::FilterDecision,
            prompts::JSON_ONLY_SYSTEM,
            prompts::filter_decision(&state.question, &candidates),
        );
        let outcome = self
            .ctx
            .complete_structured(request, &Self::schema(), |value| resolve_filters(value, plan))
            .await
            .map(|(spec, usage)| {
                let applied: usize = spec.queries.iter().map(|q| q.filter.len()).sum();
                info!(queries = spec.queries.len(), filters = applied, "Filters decided");
                let update = StateUpdate {
                    filters: Some(spec),
                    ..Default::default()
                };
                StepResult::proceed(update).with_usage(usage)
            });
        setbacks.settle(self, outcome)
    }

    fn fallback(&self, _error: &OrchestrationError) -> Transition {
        Transition::SkipTo(StepName::Execute)
    }
}

/// Apply the model's filter decisions to the chart plan.
///
/// Produces one query per chart, in plan order. Filter columns the model
/// left without a value are dropped.
pub fn resolve_filters(value: &Value, plan: &ChartPlan) -> Result<FilterSpec> {
    let decisions = value["queries"].as_array().cloned().unwrap_or_default();

    for decision in &decisions {
        let id = decision["id"].as_str().unwrap_or_default();
        if !plan.charts.iter().any(|c| c.dataset.id == id) {
            return Err(parse_error(format!("query refers to unknown dataset {:?}", id)));
        }
    }

    let mut queries = Vec::with_capacity(plan.charts.len());
    for chart in &plan.charts {
        let mut query = ExplorationQuery::unfiltered(chart);
        let decision = decisions
            .iter()
            .find(|d| d["id"].as_str() == Some(chart.dataset.id.as_str()));

        if let Some(decision) = decision {
            for entry in decision["filter"].as_array().into_iter().flatten() {
                if let Some(column) = apply_decision(chart, entry)? {
                    query.filter.push(column);
                }
            }
        }
        queries.push(query);
    }

    Ok(FilterSpec { queries })
}

fn apply_decision(chart: &ChartSpec, entry: &Value) -> Result<Option<FilterColumn>> {
    let column_id = entry["columnID"].as_str().unwrap_or_default();
    let planned = chart
        .filter
        .iter()
        .find(|f| f.column.column_id == column_id)
        .ok_or_else(|| {
            parse_error(format!(
                "filter column {:?} is not planned for dataset {:?}",
                column_id, chart.dataset.id
            ))
        })?;

    let values: Vec<String> = match &entry["value"] {
        Value::Array(items) => items.iter().filter_map(scalar_string).collect(),
        other => scalar_string(other).into_iter().collect(),
    };
    let values: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
    if values.is_empty() {
        return Ok(None);
    }

    let operator = entry["operator"]
        .as_str()
        .map(|o| o.trim().to_lowercase())
        .filter(|o| !o.is_empty())
        .unwrap_or_else(|| "in".to_string());
    if !OPERATORS.contains(&operator.as_str()) {
        return Err(parse_error(format!("unsupported operator {:?}", operator)));
    }

    let mut column = planned.clone();
    column.operator = Some(operator);
    column.value = values;
    Ok(Some(column))
}
