//! Core data models for the data-question pipeline

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

//
// ================= Steps =================
//

/// The five pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum StepName {
    Search,
    Plan,
    Filter,
    Execute,
    Interpret,
}

impl StepName {
    pub const ORDER: [StepName; 5] = [
        StepName::Search,
        StepName::Plan,
        StepName::Filter,
        StepName::Execute,
        StepName::Interpret,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// The step that follows this one on the straight path.
    pub fn next(self) -> Option<StepName> {
        Self::ORDER.get(self.index() + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::Search => "search",
            StepName::Plan => "plan",
            StepName::Filter => "filter",
            StepName::Execute => "execute",
            StepName::Interpret => "interpret",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ================= Token Usage =================
//

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

//
// ================= Catalog Data =================
//

/// One dataset hit from the catalog search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "sourceURL")]
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
}

/// A typed dataset column as exposed by the catalog.
///
/// Attributes the pipeline does not interpret are kept in `attributes` and
/// sent back verbatim to the exploration API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    #[serde(rename = "columnID")]
    pub column_id: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl ColumnInfo {
    pub fn is_temporal(&self) -> bool {
        matches!(self.kind.as_str(), "date" | "datetime")
    }

    pub fn is_spatial(&self) -> bool {
        matches!(self.kind.as_str(), "space" | "point" | "line" | "polygon")
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.kind.as_str(), "integer" | "float")
    }

    /// Name used for table headers.
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            &self.column_id
        } else {
            &self.display_name
        }
    }
}

/// Dataset descriptor plus its usable columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetMetadata {
    pub dataset: DatasetDescriptor,
    pub columns: Vec<ColumnInfo>,
}

impl DatasetMetadata {
    pub fn column(&self, column_id: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.column_id == column_id)
    }
}

/// One raw exploration row: grouped dimension values and aggregate values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExplorationRow {
    #[serde(default)]
    pub x: Vec<Vec<Value>>,
    #[serde(default)]
    pub values: Vec<Value>,
}

//
// ================= Chart Plan =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AxisColumn {
    #[serde(flatten)]
    pub column: ColumnInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricColumn {
    #[serde(flatten)]
    pub column: ColumnInfo,
    pub calculation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterColumn {
    #[serde(flatten)]
    pub column: ColumnInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<String>,
}

/// A single chart proposal for one dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartSpec {
    pub dataset: DatasetDescriptor,
    pub x: Vec<AxisColumn>,
    pub y: Vec<MetricColumn>,
    pub filter: Vec<FilterColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChartPlan {
    pub charts: Vec<ChartSpec>,
}

//
// ================= Filters =================
//

/// A fully specified exploration request for one dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExplorationQuery {
    pub dataset: DatasetDescriptor,
    pub x: Vec<AxisColumn>,
    pub y: Vec<MetricColumn>,
    pub filter: Vec<FilterColumn>,
}

impl ExplorationQuery {
    /// Query that runs a chart without any filter constraint.
    pub fn unfiltered(chart: &ChartSpec) -> Self {
        Self {
            dataset: chart.dataset.clone(),
            x: chart.x.clone(),
            y: chart.y.clone(),
            filter: Vec::new(),
        }
    }

    /// Body for the exploration endpoint.
    pub fn to_wire(&self) -> Value {
        serde_json::json!({
            "id": self.dataset.id,
            "name": self.dataset.name,
            "sourceURL": self.dataset.source_url,
            "x": self.x,
            "y": self.y,
            "filter": if self.filter.is_empty() {
                Value::Array(vec![])
            } else {
                serde_json::json!([self.filter])
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterSpec {
    pub queries: Vec<ExplorationQuery>,
}

//
// ================= Execution Result =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultTable {
    pub dataset_id: String,
    pub dataset_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows returned by the catalog before truncation.
    pub total_rows: usize,
}

impl ResultTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as objects keyed by column label.
    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub tables: Vec<ResultTable>,
}

impl ExecutionResult {
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }
}
