//! REST API server for the data-question assistant
//!
//! Exposes `Assistant::ask` over HTTP.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::assistant::{AskRequest, Assistant};
use crate::error::{ErrorKind, OrchestrationError};

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub assistant: Arc<Assistant>,
}

fn status_for(error: &OrchestrationError) -> StatusCode {
    match error.kind() {
        ErrorKind::Configuration => StatusCode::BAD_REQUEST,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Ask Endpoint
/// =============================

async fn ask(
    State(state): State<ApiState>,
    Json(req): Json<AskRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    info!(question = %req.question, "Received ask request");

    match state.assistant.ask(req).await {
        Ok(response) => (StatusCode::OK, Json(ApiResponse::success(response))),
        Err(e) => {
            warn!(error = %e, "Ask request failed");
            (status_for(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(assistant: Arc<Assistant>) -> Router {
    let state = ApiState { assistant };

    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/api/ask", post(ask))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    assistant: Arc<Assistant>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(assistant);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::FixedClients;
    use crate::catalog::{CatalogOperation, MockCatalog};
    use crate::config::Config;
    use crate::llm::MockLlm;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router(config: Config, catalog: MockCatalog) -> Router {
        let clients = FixedClients {
            catalog: Arc::new(catalog),
            llm: Arc::new(MockLlm::new()),
        };
        create_router(Arc::new(Assistant::new(Arc::new(config), Arc::new(clients))))
    }

    fn configured() -> Config {
        let mut config = Config::default();
        config.catalog.client_id = Some("id".to_string());
        config.catalog.client_secret = Some("secret".to_string());
        config.llm.api_key = Some("sk-test".to_string());
        config
    }

    fn ask_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/ask")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read(response: axum::response::Response) -> ApiResponse {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(configured(), MockCatalog::new())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ask_returns_answer() {
        let response = router(configured(), MockCatalog::new())
            .oneshot(ask_request(r#"{"question": "Where do accidents happen?"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = read(response).await;
        assert!(body.success);
        let data = body.data.unwrap();
        assert!(data["final_response"].as_str().unwrap().contains("no relevant datasets"));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_bad_request() {
        let response = router(Config::default(), MockCatalog::new())
            .oneshot(ask_request(r#"{"question": "q"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!read(response).await.success);
    }

    #[tokio::test]
    async fn test_auth_failure_is_unauthorized() {
        let catalog = MockCatalog::new().with_failures(CatalogOperation::Search, ErrorKind::Auth, 1);
        let response = router(configured(), catalog)
            .oneshot(ask_request(r#"{"question": "q"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
