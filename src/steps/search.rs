//! Search: find candidate datasets for the question

use super::{parse_error, scalar_string, Setbacks, Step, StepContext, StepResult, Transition};
use crate::catalog::SearchRequest;
use crate::error::OrchestrationError;
use crate::llm::{FieldSpec, OutputSchema, PromptKind, SchemaType};
use crate::models::{DatasetDescriptor, StepName, TokenUsage};
use crate::prompts;
use crate::retry::with_retry;
use crate::state::{State, StateUpdate};
use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

pub struct SearchStep {
    ctx: StepContext,
}

impl SearchStep {
    pub fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }

    /// Let the LLM narrow the hits down. Keeps search order.
    async fn select(
        &self,
        question: &str,
        hits: Vec<DatasetDescriptor>,
    ) -> Result<(Vec<DatasetDescriptor>, TokenUsage)> {
        let schema = OutputSchema::object(vec![FieldSpec::required(
            "dataset_keys",
            SchemaType::Array(Box::new(SchemaType::Any)),
        )]);
        let request = self.ctx.request(
            PromptKind::DatasetSelection,
            prompts::JSON_ONLY_SYSTEM,
            prompts::dataset_selection(question, &hits),
        );

        let (keys, usage) = self
            .ctx
            .complete_structured(request, &schema, |value| read_keys(value, &hits))
            .await?;

        let selected = hits.into_iter().filter(|d| keys.contains(&d.id)).collect();
        Ok((selected, usage))
    }
}

fn read_keys(value: &Value, hits: &[DatasetDescriptor]) -> Result<Vec<String>> {
    let keys: Vec<String> = value["dataset_keys"]
        .as_array()
        .map(|items| items.iter().filter_map(scalar_string).collect())
        .unwrap_or_default();

    if let Some(unknown) = keys.iter().find(|k| !hits.iter().any(|d| &d.id == *k)) {
        return Err(parse_error(format!("dataset key {:?} is not one of the search results", unknown)));
    }
    Ok(keys)
}

#[async_trait]
impl Step for SearchStep {
    fn name(&self) -> StepName {
        StepName::Search
    }

    async fn execute(&self, state: &State) -> Result<StepResult> {
        let config = &self.ctx.config;
        let request = SearchRequest {
            keyword: state.question.clone(),
            page_size: config.catalog.page_size,
        };
        let deadline = config.timeout();
        let catalog = &self.ctx.catalog;
        let request_ref = &request;

        let hits = with_retry(&config.retry, deadline, "catalog search", move || {
            catalog.search_datasets(request_ref, deadline)
        })
        .await?;

        if hits.is_empty() {
            return Err(OrchestrationError::EmptyResult(
                "no datasets matched the question".to_string(),
            ));
        }
        let found = hits.len();

        let mut setbacks = Setbacks::default();
        let (datasets, usage) = if config.dataset_selection {
            match self.select(&state.question, hits.clone()).await {
                Ok(selection) => selection,
                Err(e) if e.kind().is_fatal() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "Dataset selection failed, keeping all search results");
                    setbacks.fail("dataset selection failed", e);
                    (hits, TokenUsage::default())
                }
            }
        } else {
            (hits, TokenUsage::default())
        };

        if datasets.is_empty() {
            return Err(OrchestrationError::EmptyResult(format!(
                "none of the {} datasets found is relevant to the question",
                found
            )));
        }

        info!(found, selected = datasets.len(), "Datasets selected");
        let update = StateUpdate {
            search_results: Some(datasets),
            ..Default::default()
        };
        setbacks.settle(self, Ok(StepResult::proceed(update).with_usage(usage)))
    }

    fn fallback(&self, _error: &OrchestrationError) -> Transition {
        Transition::SkipTo(StepName::Interpret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogOperation, MockCatalog};
    use crate::config::{Config, Credentials, RetryPolicy};
    use crate::error::ErrorKind;
    use crate::llm::MockLlm;
    use crate::models::{ColumnInfo, DatasetMetadata};
    use std::sync::Arc;

    fn dataset(id: &str) -> DatasetMetadata {
        DatasetMetadata {
            dataset: DatasetDescriptor {
                id: id.to_string(),
                name: format!("dataset {}", id),
                description: String::new(),
                source_url: "https://planet.example".to_string(),
                site_name: None,
            },
            columns: vec![ColumnInfo {
                column_id: "c1".to_string(),
                display_name: "County".to_string(),
                kind: "space".to_string(),
                attributes: Default::default(),
            }],
        }
    }

    fn step(catalog: MockCatalog, llm: MockLlm, selection: bool) -> SearchStep {
        let config = Config {
            dataset_selection: selection,
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                llm_parse_retries: 1,
            },
            ..Config::default()
        };
        SearchStep::new(StepContext::new(Arc::new(config), Arc::new(catalog), Arc::new(llm)))
    }

    fn state() -> State {
        State::new("交通事故", Credentials::new("id", "secret", "key"))
    }

    #[tokio::test]
    async fn test_selection_keeps_search_order() {
        let catalog = MockCatalog::new()
            .with_dataset(dataset("a"))
            .with_dataset(dataset("b"))
            .with_dataset(dataset("c"));
        let llm = MockLlm::new().with_reply(PromptKind::DatasetSelection, r#"{"dataset_keys": ["c", "a"]}"#);

        let result = step(catalog, llm, true).execute(&state()).await.unwrap();
        let ids: Vec<_> = result
            .update
            .search_results
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(result.usage.total(), 15);
    }

    #[tokio::test]
    async fn test_unparseable_selection_keeps_everything() {
        let catalog = MockCatalog::new().with_dataset(dataset("a")).with_dataset(dataset("b"));
        let llm = MockLlm::new().with_reply(PromptKind::DatasetSelection, "I think both look fine.");

        let result = step(catalog, llm, true).execute(&state()).await.unwrap();
        assert_eq!(result.update.search_results.unwrap().len(), 2);

        let errors = &result.update.errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].step, StepName::Search);
        assert_eq!(errors[0].kind, ErrorKind::LlmParse);
    }

    #[tokio::test]
    async fn test_unreachable_model_during_selection_is_recorded() {
        let catalog = MockCatalog::new().with_dataset(dataset("a"));
        let result = step(catalog, MockLlm::new(), true).execute(&state()).await.unwrap();

        assert_eq!(result.update.search_results.unwrap().len(), 1);
        assert_eq!(result.update.errors.len(), 1);
        assert_eq!(result.update.errors[0].kind, ErrorKind::Upstream);
        assert!(result.update.errors[0].message.starts_with("dataset selection failed"));
    }

    #[tokio::test]
    async fn test_empty_search_is_empty_result() {
        let err = step(MockCatalog::new(), MockLlm::new(), true)
            .execute(&state())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::EmptyResult(_)));
    }

    #[tokio::test]
    async fn test_nothing_selected_is_empty_result() {
        let catalog = MockCatalog::new().with_dataset(dataset("a"));
        let llm = MockLlm::new().with_reply(PromptKind::DatasetSelection, r#"{"dataset_keys": []}"#);

        let err = step(catalog, llm, true).execute(&state()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyResult);
    }

    #[tokio::test]
    async fn test_transient_search_failures_are_retried() {
        let catalog = MockCatalog::new()
            .with_dataset(dataset("a"))
            .with_failures(CatalogOperation::Search, ErrorKind::Upstream, 2);
        let step = step(catalog, MockLlm::new(), false);

        let result = step.execute(&state()).await.unwrap();
        assert_eq!(result.update.search_results.unwrap().len(), 1);
    }
}
