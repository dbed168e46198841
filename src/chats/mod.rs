//! Read-only access to stored conversations.

mod history;

use axum::{Router, routing::get};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chats/{a}/{b}", get(history::between))
        .route("/monitor/messages", get(history::monitor))
}
