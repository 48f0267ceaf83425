//! HTTP client for the Aralia Data Planet catalog
//!
//! Authenticates with client credentials against the SSO realm and caches
//! the bearer token until shortly before it expires.

use super::{DataCatalog, SearchRequest};
use crate::config::{CatalogConfig, Credentials};
use crate::error::OrchestrationError;
use crate::models::{
    ColumnInfo, DatasetDescriptor, DatasetMetadata, ExplorationQuery, ExplorationRow, FilterColumn,
};
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Refresh this long before the token actually expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);
const EXPLORATION_PAGE: &str = "start=0&pageSize=1000";

const COLUMN_EXCLUDE: &[&str] = &[
    "id", "name", "datasetID", "visible", "ordinalPosition", "sortingSettingID",
];
const VIRTUAL_EXCLUDE: &[&str] = &[
    "id", "name", "datasetID", "visible", "setting", "sourceType", "language", "country",
];

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

pub struct AraliaClient {
    http: Client,
    sso_url: String,
    api_url: String,
    client_id: String,
    client_secret: String,
    reauth_on_expiry: bool,
    token: RwLock<Option<CachedToken>>,
}

impl AraliaClient {
    pub fn new(http: Client, config: &CatalogConfig, credentials: &Credentials) -> Self {
        Self {
            http,
            sso_url: config.sso_url.trim_end_matches('/').to_string(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            client_id: credentials.catalog_client_id.clone(),
            client_secret: credentials.catalog_client_secret.clone(),
            reauth_on_expiry: config.reauth_on_expiry,
            token: RwLock::new(None),
        }
    }

    async fn access_token(&self, deadline: Duration) -> Result<String> {
        {
            let cached = self.token.read().await;
            if let Some(token) = cached.as_ref() {
                if Instant::now() < token.refresh_at {
                    return Ok(token.access_token.clone());
                }
            }
        }

        let mut slot = self.token.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = slot.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        let fresh = self.authenticate(deadline).await?;
        let access_token = fresh.access_token.clone();
        *slot = Some(fresh);
        Ok(access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    async fn authenticate(&self, deadline: Duration) -> Result<CachedToken> {
        info!("Authenticating with Aralia SSO");
        let url = format!("{}/realms/stellar/protocol/openid-connect/token", self.sso_url);

        let response = self
            .http
            .post(&url)
            .timeout(deadline)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| OrchestrationError::UpstreamError(format!("SSO request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 | 401 | 403 => OrchestrationError::AuthError(format!(
                    "Aralia SSO rejected the client credentials ({})",
                    status
                )),
                _ => OrchestrationError::UpstreamError(format!("Aralia SSO returned {}: {}", status, body)),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| OrchestrationError::AuthError(format!("Malformed SSO token response: {}", e)))?;

        let lifetime = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);
        debug!(lifetime_secs = lifetime.as_secs(), "Aralia token acquired");

        Ok(CachedToken {
            access_token: token.access_token,
            refresh_at: Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN),
        })
    }

    /// Authenticated request returning the unwrapped `data` payload.
    async fn request(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        deadline: Duration,
    ) -> Result<Value> {
        let mut reauthenticated = false;

        loop {
            let token = self.access_token(deadline).await?;
            let mut builder = self
                .http
                .request(method.clone(), url)
                .bearer_auth(&token)
                .timeout(deadline);
            if !query.is_empty() {
                builder = builder.query(query);
            }
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| OrchestrationError::UpstreamError(format!("Aralia request to {} failed: {}", url, e)))?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && self.reauth_on_expiry && !reauthenticated {
                warn!(url, "Aralia token rejected, re-authenticating");
                self.invalidate_token().await;
                reauthenticated = true;
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(status_error(status, url, &text));
            }

            let envelope: Value = response
                .json()
                .await
                .map_err(|e| OrchestrationError::UpstreamError(format!("Invalid JSON from {}: {}", url, e)))?;
            return Ok(unwrap_envelope(envelope));
        }
    }
}

#[async_trait]
impl DataCatalog for AraliaClient {
    async fn search_datasets(&self, request: &SearchRequest, deadline: Duration) -> Result<Vec<DatasetDescriptor>> {
        info!(keyword = %request.keyword, page_size = request.page_size, "Searching Aralia datasets");
        let url = format!("{}/api/galaxy/dataset", self.api_url);
        let query = [
            ("keyword", request.keyword.clone()),
            ("pageSize", request.page_size.to_string()),
        ];

        let data = self.request(Method::GET, &url, &query, None, deadline).await?;
        let datasets = parse_descriptors(data);

        info!(count = datasets.len(), "Aralia search finished");
        Ok(datasets)
    }

    async fn dataset_metadata(
        &self,
        dataset: &DatasetDescriptor,
        deadline: Duration,
    ) -> Result<Option<DatasetMetadata>> {
        debug!(dataset_id = %dataset.id, "Fetching dataset metadata");
        let url = format!("{}/api/dataset/{}", dataset.source_url, dataset.id);
        let metadata = self.request(Method::GET, &url, &[], None, deadline).await?;

        let raw_columns = match metadata.get("columns").and_then(Value::as_array) {
            Some(columns) => columns.clone(),
            None => return Ok(None),
        };

        let mut columns: Vec<ColumnInfo> = raw_columns
            .iter()
            .filter(|c| c.get("type").and_then(Value::as_str) != Some("undefined"))
            .filter(|c| c.get("visible").and_then(Value::as_bool).unwrap_or(true))
            .filter_map(|c| to_column(c, COLUMN_EXCLUDE))
            .collect();

        let virtual_url = format!("{}/virtual-variables", url);
        match self.request(Method::GET, &virtual_url, &[], None, deadline).await {
            Ok(Value::Array(variables)) => {
                for variable in &variables {
                    if let Some(column) = to_column(variable, VIRTUAL_EXCLUDE) {
                        columns.retain(|c| c.column_id != column.column_id);
                        columns.push(column);
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!(dataset_id = %dataset.id, error = %e, "Could not fetch virtual variables"),
        }

        if columns.is_empty() {
            return Ok(None);
        }

        let mut descriptor = dataset.clone();
        if descriptor.description.is_empty() {
            if let Some(description) = metadata.get("description").and_then(Value::as_str) {
                descriptor.description = description.to_string();
            }
        }

        Ok(Some(DatasetMetadata {
            dataset: descriptor,
            columns,
        }))
    }

    async fn filter_options(
        &self,
        dataset: &DatasetDescriptor,
        column: &FilterColumn,
        deadline: Duration,
    ) -> Result<Vec<String>> {
        let url = format!(
            "{}/api/exploration/{}/filter-options?{}",
            dataset.source_url, dataset.id, EXPLORATION_PAGE
        );
        let body = json!({ "x": [column] });
        let data = self.request(Method::POST, &url, &[], Some(&body), deadline).await?;

        let rows: Vec<ExplorationRow> = rows_from(data)?;
        Ok(rows
            .iter()
            .filter_map(|row| row.x.first().and_then(|cell| cell.first()))
            .map(value_to_string)
            .collect())
    }

    async fn explore(&self, query: &ExplorationQuery, deadline: Duration) -> Result<Vec<ExplorationRow>> {
        info!(dataset_id = %query.dataset.id, "Executing exploration");
        let url = format!(
            "{}/api/exploration/{}?{}",
            query.dataset.source_url, query.dataset.id, EXPLORATION_PAGE
        );
        let body = query.to_wire();
        let data = self.request(Method::POST, &url, &[], Some(&body), deadline).await?;

        let rows = rows_from(data)?;
        debug!(dataset_id = %query.dataset.id, rows = rows.len(), "Exploration returned");
        Ok(rows)
    }
}

fn status_error(status: StatusCode, url: &str, body: &str) -> OrchestrationError {
    match status.as_u16() {
        401 | 403 => OrchestrationError::AuthError(format!("Aralia denied access to {} ({})", url, status)),
        _ => OrchestrationError::UpstreamError(format!("Aralia returned {} for {}: {}", status, url, body)),
    }
}

/// `data.list` when present, else `data`.
fn unwrap_envelope(envelope: Value) -> Value {
    match envelope {
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Object(mut data)) => match data.remove("list") {
                Some(list) => list,
                None => Value::Object(data),
            },
            Some(other) => other,
            None => Value::Null,
        },
        _ => Value::Null,
    }
}

/// Search hits with any `/admin…` suffix cut from the source URL.
fn parse_descriptors(data: Value) -> Vec<DatasetDescriptor> {
    let items = match data {
        Value::Array(items) => items,
        _ => return Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|mut item| {
            if let Some(Value::String(url)) = item.get_mut("sourceURL") {
                if let Some(pos) = url.find("/admin") {
                    url.truncate(pos);
                }
            }
            match serde_json::from_value::<DatasetDescriptor>(item) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed search hit");
                    None
                }
            }
        })
        .collect()
}

fn to_column(raw: &Value, exclude: &[&str]) -> Option<ColumnInfo> {
    let object = raw.as_object()?;
    let id = object.get("id")?.clone();

    let mut cleaned: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| !exclude.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    cleaned.insert("columnID".to_string(), id);

    serde_json::from_value(Value::Object(cleaned)).ok()
}

fn rows_from(data: Value) -> Result<Vec<ExplorationRow>> {
    match data {
        Value::Array(_) => Ok(serde_json::from_value(data)?),
        _ => Ok(Vec::new()),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
