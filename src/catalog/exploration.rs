//! Flattening raw exploration rows into labelled tables

use crate::models::{ExplorationQuery, ExplorationRow, ResultTable};
use serde_json::Value;

/// Rows kept per table; the rest only count towards `total_rows`.
pub const MAX_TABLE_ROWS: usize = 400;

/// Turn exploration rows into a table.
///
/// Headers are the x display names followed by the y display names. When
/// the row shape disagrees with the query, generic `x1…`/`value1…` headers
/// are used instead.
pub fn build_table(query: &ExplorationQuery, rows: Vec<ExplorationRow>) -> ResultTable {
    let x_labels: Vec<String> = query.x.iter().map(|a| a.column.label().to_string()).collect();
    let y_labels: Vec<String> = query.y.iter().map(|m| m.column.label().to_string()).collect();

    let x_width = rows.first().map_or(x_labels.len(), |r| r.x.len());
    let y_width = rows.first().map_or(y_labels.len(), |r| r.values.len());

    let mut columns = headers(x_labels, x_width, "x");
    columns.extend(headers(y_labels, y_width, "value"));

    let total_rows = rows.len();
    let rows = rows
        .into_iter()
        .take(MAX_TABLE_ROWS)
        .map(|row| {
            let mut cells: Vec<Value> = row
                .x
                .into_iter()
                .map(|group| group.into_iter().next().unwrap_or(Value::Null))
                .collect();
            cells.extend(row.values);
            cells
        })
        .collect();

    ResultTable {
        dataset_id: query.dataset.id.clone(),
        dataset_name: query.dataset.name.clone(),
        columns,
        rows,
        total_rows,
    }
}

fn headers(labels: Vec<String>, width: usize, prefix: &str) -> Vec<String> {
    if labels.len() == width {
        labels
    } else {
        (1..=width).map(|i| format!("{}{}", prefix, i)).collect()
    }
}
