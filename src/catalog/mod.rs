//! Data catalog abstraction
//!
//! The pipeline only needs four catalog operations. Each one takes the
//! deadline for that single call; retries are layered on by the caller.

use crate::models::{DatasetDescriptor, DatasetMetadata, ExplorationQuery, ExplorationRow, FilterColumn};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod aralia;
pub mod exploration;
pub mod mock;

pub use aralia::AraliaClient;
pub use exploration::{build_table, MAX_TABLE_ROWS};
pub use mock::MockCatalog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub keyword: String,
    pub page_size: u32,
}

/// Names a catalog operation, for logs and scripted test failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CatalogOperation {
    Search,
    Metadata,
    FilterOptions,
    Explore,
}

impl fmt::Display for CatalogOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CatalogOperation::Search => "catalog search",
            CatalogOperation::Metadata => "dataset metadata",
            CatalogOperation::FilterOptions => "filter options",
            CatalogOperation::Explore => "exploration",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait DataCatalog: Send + Sync {
    /// Keyword search over the catalog, in relevance order.
    async fn search_datasets(&self, request: &SearchRequest, deadline: Duration) -> Result<Vec<DatasetDescriptor>>;

    /// Usable columns of a dataset. `None` when the catalog has nothing for it.
    async fn dataset_metadata(
        &self,
        dataset: &DatasetDescriptor,
        deadline: Duration,
    ) -> Result<Option<DatasetMetadata>>;

    /// Distinct values a filter column can take.
    async fn filter_options(
        &self,
        dataset: &DatasetDescriptor,
        column: &FilterColumn,
        deadline: Duration,
    ) -> Result<Vec<String>>;

    /// Run an aggregation query and return the raw rows.
    async fn explore(&self, query: &ExplorationQuery, deadline: Duration) -> Result<Vec<ExplorationRow>>;
}
