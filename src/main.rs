use std::sync::Arc;

use anyhow::Context;
use chatrelay::{AppState, config::Config, store::SqliteStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatrelay=debug,tower_http=info,info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let store = SqliteStore::connect(&config.database_url, config.db_max_connections)
        .await
        .with_context(|| format!("opening {}", config.database_url))?;

    let app_state = AppState::new(Arc::new(store), config.presence_buffer);
    let app = chatrelay::router(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "chat relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}
