use axum::{
    routing::{get, post},
    Router,
};

pub mod connections;
pub mod messages;
pub mod organizations;
pub mod receipts;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/registry/receipts", post(receipts::webhook))
        .route("/connections/:id/messages/open", get(connections::open_messages))
        .route("/connections/:id/reactivate", post(connections::reactivate))
        .route("/organizations/:id/messages/errors", get(organizations::error_messages))
        .route("/organizations/:id/drift/latest", get(organizations::latest_drift))
        .route("/organizations/:id/stats", get(organizations::stats))
        .route("/messages/:id", get(messages::detail))
        .route("/messages/:id/replay", post(messages::replay))
}
