use aralia_orchestrator::{api::start_server, Assistant, Config};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Reads .env as well
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("aralia_orchestrator={},tower_http=info,warn", config.log_level))),
        )
        .init();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Aralia assistant - API Server");
    info!(port = api_port, catalog = %config.catalog.api_url, "Configuration loaded");

    if config.catalog.client_id.is_none() || config.llm.api_key.is_none() {
        info!("Credentials not fully set in the environment; requests must supply them");
    }

    let assistant = Arc::new(Assistant::from_config(config)?);

    info!("Assistant initialized, starting API server");
    start_server(assistant, api_port).await?;

    Ok(())
}
