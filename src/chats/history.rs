use std::sync::Arc;

use axum::{Json, debug_handler, extract::{Path, State}};

use crate::{AppResult, AppState, relay::RelayEngine, store::Message};

#[debug_handler(state = AppState)]
pub(crate) async fn between(
    Path((a, b)): Path<(String, String)>,
    State(relay): State<Arc<RelayEngine>>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(relay.history(&a, &b).await?))
}

/// Every message, newest first. Whoever mounts this router is expected to
/// restrict it to administrators.
#[debug_handler(state = AppState)]
pub(crate) async fn monitor(
    State(relay): State<Arc<RelayEngine>>,
) -> AppResult<Json<Vec<Message>>> {
    Ok(Json(relay.monitor().await?))
}
