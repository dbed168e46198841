use std::sync::Arc;

use axum::{Json, Router, debug_handler, extract::State, routing::get};

use crate::{AppResult, AppState, presence::PresenceRegistry, store::{ChatStore, UserPresence}};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", get(users))
        .route("/presence", get(presence))
}

/// Stored presence of everyone who ever joined.
#[debug_handler(state = AppState)]
async fn users(
    State(store): State<Arc<dyn ChatStore>>,
) -> AppResult<Json<Vec<UserPresence>>> {
    Ok(Json(store.users().await?))
}

/// Identities reachable on this process right now.
#[debug_handler(state = AppState)]
async fn presence(
    State(registry): State<Arc<PresenceRegistry>>,
) -> Json<Vec<String>> {
    Json(registry.online())
}
