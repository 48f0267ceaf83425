//! Prompt templates and the vocabularies they constrain the model to

use crate::models::{ChartPlan, DatasetDescriptor, DatasetMetadata, ExecutionResult};
use serde_json::{json, Value};

pub const DATE_FORMATS: &[&str] = &[
    "year", "quarter", "month", "week", "date", "day", "weekday", "year_month",
    "year_quarter", "year_week", "month_day", "day_hour", "hour", "minute", "second",
    "hour_minute", "time",
];

pub const SPACE_FORMATS: &[&str] = &[
    "admin_level_2", "admin_level_3", "admin_level_4", "admin_level_5", "admin_level_6",
    "admin_level_7", "admin_level_8", "admin_level_9", "admin_level_10",
];

pub const CALCULATIONS: &[&str] = &["count", "sum", "avg", "min", "max", "distinct_count"];

pub const OPERATORS: &[&str] = &["eq", "lt", "gt", "lte", "gte", "in", "range"];

/// Administrative level names per region, used to pick a spatial granularity.
pub const ADMIN_LEVELS: &[(&str, &[(&str, &str)])] = &[
    (
        "Taiwan",
        &[
            ("admin_level_2", "國家"),
            ("admin_level_4", "直轄市/縣市/六都"),
            ("admin_level_7", "直轄市的區"),
            ("admin_level_8", "縣轄市/鄉鎮"),
            ("admin_level_9", "村/里"),
            ("admin_level_10", "鄰"),
        ],
    ),
    (
        "Japan",
        &[
            ("admin_level_2", "Country"),
            ("admin_level_4", "Prefecture (To/Dō/Fu/Ken)"),
            ("admin_level_5", "Subprefecture (Hokkaido only)"),
            ("admin_level_6", "County (Gun) / City subprefecture (Tokyo)"),
            ("admin_level_7", "City / Town / Village"),
            ("admin_level_8", "Ward (Ku, in designated cities)"),
            ("admin_level_9", "District / Town block (Chō/Machi/Chōme)"),
            ("admin_level_10", "Area (Ōaza/Aza) / Block number (Banchi)"),
        ],
    ),
    (
        "Malaysia",
        &[
            ("admin_level_2", "Country"),
            ("admin_level_4", "State (Negeri) / Federal Territory"),
            ("admin_level_5", "Division (Sabah & Sarawak only)"),
            ("admin_level_6", "District (Daerah)"),
            ("admin_level_7", "Subdistrict (Daerah Kecil / Mukim)"),
            ("admin_level_8", "Mukim / Town (Bandar) / Village (Kampung)"),
        ],
    ),
    (
        "Singapore",
        &[
            ("admin_level_2", "Country"),
            ("admin_level_6", "District (Community Development Council)"),
        ],
    ),
];

pub const JSON_ONLY_SYSTEM: &str =
    "You are a senior data analyst. Reply with a single JSON object inside a ```json fenced block.";

pub const ANALYST_SYSTEM: &str =
    "You are an expert data analyst. Answer in the same language as the question.";

pub fn admin_levels_json() -> Value {
    let regions: serde_json::Map<String, Value> = ADMIN_LEVELS
        .iter()
        .map(|(region, levels)| {
            let levels: serde_json::Map<String, Value> = levels
                .iter()
                .map(|(level, name)| (level.to_string(), json!(name)))
                .collect();
            (region.to_string(), Value::Object(levels))
        })
        .collect();
    Value::Object(regions)
}

pub fn dataset_selection(question: &str, datasets: &[DatasetDescriptor]) -> String {
    let listing: Vec<Value> = datasets
        .iter()
        .map(|d| json!({"key": d.id, "name": d.name, "description": d.description}))
        .collect();

    format!(
        r#"Filter the datasets below down to the ones that directly help answer the question.

Question: {question}

Available datasets:
{datasets}

Rules:
1. Identify the core intent and key entities of the question.
2. Keep datasets that directly contain the required information.
3. Drop datasets that are indirect, redundant or only tangentially related.
4. Prefer fewer, highly relevant datasets.

Return JSON: {{"dataset_keys": ["<key>", ...]}}"#,
        question = question,
        datasets = pretty(&Value::Array(listing)),
    )
}

pub fn chart_plan(question: &str, metadata: &[DatasetMetadata]) -> String {
    let datasets: Vec<Value> = metadata
        .iter()
        .map(|m| {
            json!({
                "id": m.dataset.id,
                "name": m.dataset.name,
                "description": m.dataset.description,
                "columns": m.columns,
            })
        })
        .collect();

    format!(
        r#"Propose exactly one chart for each dataset that is relevant to the question.

Question: {question}

Datasets (with column metadata):
{datasets}

admin_level:
{admin_levels}

Steps:
1. Break the question down into metrics, a primary axis dimension and any grouping dimensions.
2. Keep only the best datasets and the minimum set of columns needed.
3. Columns typed date/datetime/space/nominal/ordinal/point/line/polygon go on "x".
4. Columns typed integer/float that are metrics go on "y".
5. Put temporal, spatial or categorical constraints on "filter". A grouping column often belongs in both "x" and "filter".
6. For date/datetime columns "format" is one of {date_formats}.
7. For space/point/line/polygon columns "format" is the most general admin_level_N that fits the question.
8. For other columns "format" is "".
9. For "y" columns "calculation" is one of {calculations}.

Return JSON:
{{
  "charts": [
    {{
      "id": "<dataset id>",
      "x": [{{"columnID": "<column id>", "format": ""}}],
      "y": [{{"columnID": "<column id>", "calculation": "sum"}}],
      "filter": [{{"columnID": "<column id>", "format": ""}}]
    }}
  ]
}}"#,
        question = question,
        datasets = pretty(&Value::Array(datasets)),
        admin_levels = pretty(&admin_levels_json()),
        date_formats = quoted_list(DATE_FORMATS),
        calculations = quoted_list(CALCULATIONS),
    )
}

/// `candidates` carries, per chart, the filter columns and their known values.
pub fn filter_decision(question: &str, candidates: &Value) -> String {
    format!(
        r#"Choose filter operators and values for the queries below.

Question: {question}

Queries:
{queries}

Rules:
1. Keep every query id and every filter column; only decide "operator" and "value".
2. Date, datetime, nominal and spatial columns use "in".
3. Integer and float columns use one of "range", "lt", "gt", "lte", "gte".
4. Pick values from "options" whenever options are listed.
5. Check geographic relationships: an office named after one city may sit in another.
6. Leave "value" empty when the question does not constrain a column.

Return JSON:
{{
  "queries": [
    {{"id": "<dataset id>", "filter": [{{"columnID": "<column id>", "operator": "in", "value": ["..."]}}]}}
  ]
}}"#,
        question = question,
        queries = pretty(candidates),
    )
}

pub fn interpretation(
    question: &str,
    result: Option<&ExecutionResult>,
    plan: Option<&ChartPlan>,
    notes: &[String],
    errors: &[String],
    instructions: Option<&str>,
) -> String {
    let tables: Vec<Value> = result
        .map(|r| {
            r.tables
                .iter()
                .map(|t| {
                    json!({
                        "dataset": t.dataset_name,
                        "rows_returned": t.total_rows,
                        "json_data": t.records(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let charts: Vec<Value> = plan
        .map(|p| {
            p.charts
                .iter()
                .map(|c| {
                    json!({
                        "dataset": c.dataset.name,
                        "x": c.x.iter().map(|a| a.column.label()).collect::<Vec<_>>(),
                        "y": c.y.iter().map(|m| format!("{}({})", m.calculation, m.column.label())).collect::<Vec<_>>(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let mut prompt = format!(
        r#"Question: {question}

Data results ("json_data" is the actual retrieved data):
{tables}

Chart plan:
{charts}"#,
        question = question,
        tables = pretty(&Value::Array(tables)),
        charts = pretty(&Value::Array(charts)),
    );

    if !notes.is_empty() {
        prompt.push_str("\n\nNotes:\n- ");
        prompt.push_str(&notes.join("\n- "));
    }
    if !errors.is_empty() {
        prompt.push_str("\n\nProblems encountered while retrieving data:\n- ");
        prompt.push_str(&errors.join("\n- "));
    }

    match instructions {
        Some(custom) => {
            prompt.push_str("\n\n");
            prompt.push_str(custom);
        }
        None => prompt.push_str(
            r#"

Answer the question from the data above.
- Reply in exactly the language of the question.
- Structure: data overview, key findings, direct answer, conclusion.
- Keep the conclusion under 300 words.
- Support every claim with the retrieved data; say so when the data is incomplete."#,
        ),
    }
    prompt
}

/// Appended to a prompt after the model's answer failed validation.
pub fn corrective(prompt: &str, problem: &str) -> String {
    format!(
        "{}\n\nYour previous answer could not be used: {}\nReturn only the JSON object in the requested format.",
        prompt, problem
    )
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn quoted_list(items: &[&str]) -> String {
    let quoted: Vec<String> = items.iter().map(|s| format!("\"{}\"", s)).collect();
    format!("[{}]", quoted.join(", "))
}
