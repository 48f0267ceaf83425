//! Plan: turn dataset metadata into one chart proposal per dataset

use super::{parse_error, Setbacks, Step, StepContext, StepResult, Transition};
use crate::error::OrchestrationError;
use crate::llm::{FieldSpec, OutputSchema, PromptKind, SchemaType};
use crate::models::{AxisColumn, ChartPlan, ChartSpec, ColumnInfo, DatasetMetadata, FilterColumn, MetricColumn, StepName};
use crate::prompts::{self, CALCULATIONS, DATE_FORMATS, SPACE_FORMATS};
use crate::retry::with_retry;
use crate::state::{State, StateUpdate};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Keys the pipeline sets itself on plan columns.
const RESERVED_KEYS: &[&str] = &["format", "calculation", "operator", "value"];

pub struct PlanStep {
    ctx: StepContext,
}

impl PlanStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }

    fn schema() -> OutputSchema {
        let column = |extra: &str| {
            SchemaType::Object(vec![
                FieldSpec::required("columnID", SchemaType::String),
                FieldSpec::optional(extra, SchemaType::String),
            ])
        };
        OutputSchema::object(vec![FieldSpec::required(
            "charts",
            SchemaType::Array(Box::new(SchemaType::Object(vec![
                FieldSpec::required("id", SchemaType::String),
                FieldSpec::optional("x", SchemaType::Array(Box::new(column("format")))),
                FieldSpec::optional("y", SchemaType::Array(Box::new(column("calculation")))),
                FieldSpec::optional("filter", SchemaType::Array(Box::new(column("format")))),
            ]))),
        )])
    }

    /// Metadata for every dataset that has any. Non-fatal failures skip the dataset.
    async fn collect_metadata(&self, state: &State, setbacks: &mut Setbacks) -> Result<Vec<DatasetMetadata>> {
        let config = &self.ctx.config;
        let deadline = config.timeout();
        let catalog = &self.ctx.catalog;
        let mut collected = Vec::new();

        for dataset in state.datasets() {
            let outcome = with_retry(&config.retry, deadline, "dataset metadata", move || {
                catalog.dataset_metadata(dataset, deadline)
            })
            .await;

            match outcome {
                Ok(Some(metadata)) => collected.push(metadata),
                Ok(None) => debug!(dataset_id = %dataset.id, "Dataset has no usable columns"),
                Err(e) if e.kind().is_fatal() => return Err(e),
                Err(e) => {
                    warn!(dataset_id = %dataset.id, error = %e, "Skipping dataset without metadata");
                    setbacks.fail(format!("metadata for \"{}\" could not be retrieved", dataset.name), e);
                }
            }
        }
        Ok(collected)
    }

    async fn plan_charts(&self, state: &State, metadata: &[DatasetMetadata]) -> Result<StepResult> {
        let request = self.ctx.request(
            PromptKind::ChartPlan,
            prompts::JSON_ONLY_SYSTEM,
            prompts::chart_plan(&state.question, metadata),
        );
        let (plan, usage) = self
            .ctx
            .complete_structured(request, &Self::schema(), |value| resolve_plan(value, metadata))
            .await?;

        if plan.charts.is_empty() {
            return Err(OrchestrationError::EmptyResult(
                "no chart could be planned for the question".to_string(),
            ));
        }

        info!(charts = plan.charts.len(), "Chart plan ready");
        let update = StateUpdate {
            chart_plan: Some(plan),
            ..Default::default()
        };
        Ok(StepResult::proceed(update).with_usage(usage))
    }
}

#[async_trait]
impl Step for PlanStep {
    fn name(&self) -> StepName {
        StepName::Plan
    }

    async fn execute(&self, state: &State) -> Result<StepResult> {
        if state.datasets().is_empty() {
            return Err(OrchestrationError::EmptyResult("no datasets to plan for".to_string()));
        }

        let mut setbacks = Setbacks::default();
        let metadata = self.collect_metadata(state, &mut setbacks).await?;
        if metadata.is_empty() {
            let err = setbacks.take_last().unwrap_or_else(|| {
                OrchestrationError::EmptyResult("no metadata available for the selected datasets".to_string())
            });
            return setbacks.settle(self, Err(err));
        }

        let outcome = self.plan_charts(state, &metadata).await;
        setbacks.settle(self, outcome)
    }

    fn fallback(&self, _error: &OrchestrationError) -> Transition {
        Transition::SkipTo(StepName::Interpret)
    }
}

/// Resolve the model's chart proposals against real column metadata.
pub fn resolve_plan(value: &Value, metadata: &[DatasetMetadata]) -> Result<ChartPlan> {
    let proposals = value["charts"].as_array().cloned().unwrap_or_default();
    let mut charts: Vec<ChartSpec> = Vec::new();

    for proposal in &proposals {
        let id = proposal["id"].as_str().unwrap_or_default();
        let dataset = metadata
            .iter()
            .find(|m| m.dataset.id == id)
            .ok_or_else(|| parse_error(format!("chart refers to unknown dataset {:?}", id)))?;
        if charts.iter().any(|c| c.dataset.id == id) {
            continue;
        }

        let mut x = Vec::new();
        for entry in entries(&proposal["x"]) {
            let column = lookup(dataset, entry)?;
            let format = normalise_format(&column, entry["format"].as_str());
            x.push(AxisColumn { column, format });
        }

        let mut y = Vec::new();
        for entry in entries(&proposal["y"]) {
            let column = lookup(dataset, entry)?;
            let calculation = entry["calculation"]
                .as_str()
                .map(|c| c.trim().to_lowercase())
                .unwrap_or_default();
            if column.is_numeric() && CALCULATIONS.contains(&calculation.as_str()) {
                y.push(MetricColumn { column, calculation });
            } else {
                debug!(column = %column.column_id, calculation = %calculation, "Dropping invalid metric");
            }
        }

        let mut filter = Vec::new();
        for entry in entries(&proposal["filter"]) {
            let column = lookup(dataset, entry)?;
            let format = normalise_format(&column, entry["format"].as_str());
            filter.push(FilterColumn {
                column,
                format,
                operator: None,
                value: Vec::new(),
            });
        }

        if x.is_empty() && y.is_empty() {
            debug!(dataset_id = %id, "Dropping chart without axes");
            continue;
        }

        charts.push(ChartSpec {
            dataset: dataset.dataset.clone(),
            x,
            y,
            filter,
        });
    }

    Ok(ChartPlan { charts })
}

fn entries(value: &Value) -> impl Iterator<Item = &Value> {
    value.as_array().into_iter().flatten()
}

fn lookup(dataset: &DatasetMetadata, entry: &Value) -> Result<ColumnInfo> {
    let column_id = entry["columnID"].as_str().unwrap_or_default();
    let mut column = dataset.column(column_id).cloned().ok_or_else(|| {
        parse_error(format!(
            "column {:?} does not exist in dataset {:?}",
            column_id, dataset.dataset.id
        ))
    })?;
    for key in RESERVED_KEYS {
        column.attributes.remove(*key);
    }
    Ok(column)
}

/// Valid format for the column type, defaulting when the model's is unusable.
fn normalise_format(column: &ColumnInfo, proposed: Option<&str>) -> Option<String> {
    let proposed = proposed.map(|f| f.trim().to_lowercase()).unwrap_or_default();

    if column.is_temporal() {
        let format = if DATE_FORMATS.contains(&proposed.as_str()) { proposed } else { "year".to_string() };
        Some(format)
    } else if column.is_spatial() {
        let format = if SPACE_FORMATS.contains(&proposed.as_str()) {
            proposed
        } else {
            "admin_level_4".to_string()
        };
        Some(format)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogOperation, MockCatalog};
    use crate::config::{Config, Credentials, RetryPolicy};
    use crate::error::ErrorKind;
    use crate::llm::MockLlm;
    use crate::models::DatasetDescriptor;
    use crate::state::StepStatus;
    use serde_json::json;
    use std::sync::Arc;

    fn column(id: &str, display: &str, kind: &str) -> ColumnInfo {
        let mut attributes = serde_json::Map::new();
        attributes.insert("format".to_string(), json!("legacy"));
        ColumnInfo {
            column_id: id.to_string(),
            display_name: display.to_string(),
            kind: kind.to_string(),
            attributes,
        }
    }

    fn metadata() -> Vec<DatasetMetadata> {
        vec![DatasetMetadata {
            dataset: DatasetDescriptor {
                id: "acc".to_string(),
                name: "Traffic accidents".to_string(),
                description: String::new(),
                source_url: "https://planet.example".to_string(),
                site_name: None,
            },
            columns: vec![
                column("county", "County", "space"),
                column("date", "Date", "date"),
                column("deaths", "Deaths", "integer"),
                column("cause", "Cause", "nominal"),
            ],
        }]
    }

    #[test]
    fn test_resolves_and_normalises() {
        let value = json!({"charts": [{
            "id": "acc",
            "x": [{"columnID": "county", "format": "ADMIN_LEVEL_4"}, {"columnID": "date", "format": "fortnight"}],
            "y": [{"columnID": "deaths", "calculation": "Sum"}, {"columnID": "cause", "calculation": "sum"}],
            "filter": [{"columnID": "date", "format": "year"}]
        }]});

        let plan = resolve_plan(&value, &metadata()).unwrap();
        let chart = &plan.charts[0];
        assert_eq!(chart.x[0].format.as_deref(), Some("admin_level_4"));
        assert_eq!(chart.x[1].format.as_deref(), Some("year"));
        assert_eq!(chart.y.len(), 1);
        assert_eq!(chart.y[0].calculation, "sum");
        assert!(!chart.x[0].column.attributes.contains_key("format"));
        assert_eq!(chart.filter[0].format.as_deref(), Some("year"));
    }

    #[test]
    fn test_unknown_column_is_parse_error() {
        let value = json!({"charts": [{"id": "acc", "x": [{"columnID": "weather"}]}]});
        let err = resolve_plan(&value, &metadata()).unwrap_err();
        assert!(matches!(err, OrchestrationError::LlmParseError(_)));
    }

    #[test]
    fn test_unknown_dataset_is_parse_error() {
        let value = json!({"charts": [{"id": "other", "x": []}]});
        assert!(resolve_plan(&value, &metadata()).is_err());
    }

    #[test]
    fn test_duplicate_and_empty_charts_are_dropped() {
        let value = json!({"charts": [
            {"id": "acc", "x": [{"columnID": "county", "format": "admin_level_4"}]},
            {"id": "acc", "x": [{"columnID": "date", "format": "year"}]}
        ]});
        let plan = resolve_plan(&value, &metadata()).unwrap();
        assert_eq!(plan.charts.len(), 1);
        assert_eq!(plan.charts[0].x[0].column.column_id, "county");

        let empty = json!({"charts": [{"id": "acc", "y": [{"columnID": "cause", "calculation": "avg"}]}]});
        assert!(resolve_plan(&empty, &metadata()).unwrap().charts.is_empty());
    }

    fn rain() -> DatasetDescriptor {
        DatasetDescriptor {
            id: "rain".to_string(),
            name: "Rainfall".to_string(),
            description: String::new(),
            source_url: "https://planet.example".to_string(),
            site_name: None,
        }
    }

    fn step(catalog: MockCatalog, llm: MockLlm) -> (PlanStep, Arc<MockLlm>) {
        let config = Config {
            retry: RetryPolicy {
                max_retries: 0,
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
                llm_parse_retries: 0,
            },
            ..Config::default()
        };
        let llm = Arc::new(llm);
        let ctx = StepContext::new(Arc::new(config), Arc::new(catalog), llm.clone());
        (PlanStep::new(ctx), llm)
    }

    fn searched(datasets: Vec<DatasetDescriptor>) -> State {
        let mut state = State::new("q", Credentials::new("id", "secret", "key"));
        state.search_results = Some(datasets);
        state
    }

    #[tokio::test]
    async fn test_metadata_failure_is_recorded_and_planning_continues() {
        let acc = metadata().remove(0);
        let catalog = MockCatalog::new()
            .with_bare_dataset(rain())
            .with_dataset(acc.clone())
            .with_failures(CatalogOperation::Metadata, ErrorKind::Upstream, 1);
        let llm = MockLlm::new().with_reply(
            PromptKind::ChartPlan,
            r#"{"charts": [{"id": "acc", "x": [{"columnID": "county", "format": "admin_level_4"}]}]}"#,
        );
        let (step, _) = step(catalog, llm);

        let result = step.execute(&searched(vec![rain(), acc.dataset])).await.unwrap();
        assert_eq!(result.status, StepStatus::Completed);
        assert_eq!(result.update.chart_plan.unwrap().charts.len(), 1);

        let errors = &result.update.errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].step, StepName::Plan);
        assert_eq!(errors[0].kind, ErrorKind::Upstream);
        assert!(errors[0].message.contains("\"Rainfall\""));
    }

    #[tokio::test]
    async fn test_no_metadata_at_all_skips_the_model() {
        let acc = metadata().remove(0);
        let catalog = MockCatalog::new()
            .with_bare_dataset(rain())
            .with_dataset(acc.clone())
            .with_failures(CatalogOperation::Metadata, ErrorKind::Upstream, 2);
        let (step, llm) = step(catalog, MockLlm::new());

        let result = step.execute(&searched(vec![rain(), acc.dataset])).await.unwrap();
        assert_eq!(result.status, StepStatus::Failed);
        assert_eq!(result.transition, Transition::SkipTo(StepName::Interpret));
        assert_eq!(result.update.errors.len(), 2);
        assert!(result.update.chart_plan.is_none());
        assert_eq!(llm.total_calls().await, 0);
    }
}
