//! In-memory catalog for development & testing

use super::{CatalogOperation, DataCatalog, SearchRequest};
use crate::error::{ErrorKind, OrchestrationError};
use crate::models::{DatasetDescriptor, DatasetMetadata, ExplorationQuery, ExplorationRow, FilterColumn};
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Default)]
struct Journal {
    failures: HashMap<CatalogOperation, VecDeque<ErrorKind>>,
    calls: HashMap<CatalogOperation, usize>,
    explored: Vec<ExplorationQuery>,
}

/// Serves fixed datasets, metadata and rows, with scripted failures.
#[derive(Default)]
pub struct MockCatalog {
    datasets: Vec<DatasetDescriptor>,
    metadata: HashMap<String, DatasetMetadata>,
    options: HashMap<(String, String), Vec<String>>,
    rows: HashMap<String, Vec<ExplorationRow>>,
    journal: Mutex<Journal>,
}

impl MockCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset together with its column metadata.
    pub fn with_dataset(mut self, metadata: DatasetMetadata) -> Self {
        self.datasets.push(metadata.dataset.clone());
        self.metadata.insert(metadata.dataset.id.clone(), metadata);
        self
    }

    /// Register a search hit that has no metadata behind it.
    pub fn with_bare_dataset(mut self, dataset: DatasetDescriptor) -> Self {
        self.datasets.push(dataset);
        self
    }

    pub fn with_filter_options(mut self, dataset_id: &str, column_id: &str, values: &[&str]) -> Self {
        self.options.insert(
            (dataset_id.to_string(), column_id.to_string()),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn with_rows(mut self, dataset_id: &str, rows: Vec<ExplorationRow>) -> Self {
        self.rows.insert(dataset_id.to_string(), rows);
        self
    }

    /// Fail the next `times` calls of `operation` with an error of `kind`.
    pub fn with_failures(mut self, operation: CatalogOperation, kind: ErrorKind, times: usize) -> Self {
        self.journal
            .get_mut()
            .failures
            .entry(operation)
            .or_default()
            .extend(std::iter::repeat(kind).take(times));
        self
    }

    pub async fn calls(&self, operation: CatalogOperation) -> usize {
        self.journal
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Queries received by `explore`, oldest first.
    pub async fn explored(&self) -> Vec<ExplorationQuery> {
        self.journal.lock().await.explored.clone()
    }

    async fn enter(&self, operation: CatalogOperation) -> Result<()> {
        let mut journal = self.journal.lock().await;
        *journal.calls.entry(operation).or_insert(0) += 1;

        match journal.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(kind) => Err(scripted_error(operation, kind)),
            None => Ok(()),
        }
    }
}

fn scripted_error(operation: CatalogOperation, kind: ErrorKind) -> OrchestrationError {
    OrchestrationError::from_kind(kind, format!("scripted {} failure", operation))
}

#[async_trait]
impl DataCatalog for MockCatalog {
    async fn search_datasets(&self, request: &SearchRequest, _deadline: Duration) -> Result<Vec<DatasetDescriptor>> {
        self.enter(CatalogOperation::Search).await?;
        Ok(self
            .datasets
            .iter()
            .take(request.page_size as usize)
            .cloned()
            .collect())
    }

    async fn dataset_metadata(
        &self,
        dataset: &DatasetDescriptor,
        _deadline: Duration,
    ) -> Result<Option<DatasetMetadata>> {
        self.enter(CatalogOperation::Metadata).await?;
        Ok(self.metadata.get(&dataset.id).cloned())
    }

    async fn filter_options(
        &self,
        dataset: &DatasetDescriptor,
        column: &FilterColumn,
        _deadline: Duration,
    ) -> Result<Vec<String>> {
        self.enter(CatalogOperation::FilterOptions).await?;
        let key = (dataset.id.clone(), column.column.column_id.clone());
        Ok(self.options.get(&key).cloned().unwrap_or_default())
    }

    async fn explore(&self, query: &ExplorationQuery, _deadline: Duration) -> Result<Vec<ExplorationRow>> {
        self.enter(CatalogOperation::Explore).await?;
        self.journal.lock().await.explored.push(query.clone());
        Ok(self.rows.get(&query.dataset.id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SearchRequest {
        SearchRequest {
            keyword: "accidents".to_string(),
            page_size: 50,
        }
    }

    #[tokio::test]
    async fn test_scripted_failures_drain() {
        let catalog = MockCatalog::new().with_failures(CatalogOperation::Search, ErrorKind::Upstream, 2);
        let deadline = Duration::from_secs(1);

        assert!(catalog.search_datasets(&request(), deadline).await.is_err());
        assert!(catalog.search_datasets(&request(), deadline).await.is_err());
        assert!(catalog.search_datasets(&request(), deadline).await.unwrap().is_empty());
        assert_eq!(catalog.calls(CatalogOperation::Search).await, 3);
    }

    #[tokio::test]
    async fn test_auth_failure_kind() {
        let catalog = MockCatalog::new().with_failures(CatalogOperation::Search, ErrorKind::Auth, 1);
        let err = catalog
            .search_datasets(&request(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::AuthError(_)));
    }
}
