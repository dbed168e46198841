pub mod chats;
pub mod config;
pub mod events;
pub mod gateway;
pub mod presence;
pub mod relay;
pub mod store;
pub mod users;

use std::sync::Arc;

use axum::{Router, extract::FromRef, http::StatusCode, response::{IntoResponse, Response}, routing::get};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use presence::PresenceRegistry;
use relay::RelayEngine;
use store::ChatStore;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub registry: Arc<PresenceRegistry>,
    pub relay: Arc<RelayEngine>,
}

impl AppState {
    pub fn new(store: Arc<dyn ChatStore>, presence_buffer: usize) -> Self {
        let registry = Arc::new(PresenceRegistry::new(store.clone(), presence_buffer));
        let relay = Arc::new(RelayEngine::new(registry.clone(), store.clone()));
        Self { store, registry, relay }
    }
}

pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(gateway::router())
        .merge(chats::router())
        .merge(users::router())
        .with_state(app_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "OK"
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!("request failed: {:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}\n\n{}", self.0, self.0.backtrace()),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
