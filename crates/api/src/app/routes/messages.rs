use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use regsync_core::MessageId;

use crate::app::{dto::MessageDetail, errors, services::AppServices};

pub async fn detail(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    let id = MessageId::from_uuid(id);
    let store = services.store();
    let message = match store.get_message(id).await {
        Ok(Some(m)) => m,
        Ok(None) => return errors::not_found(format!("message {id}")),
        Err(e) => return errors::store_error_to_response(e),
    };
    let receipts = match store.receipts_for_message(id).await {
        Ok(r) => r,
        Err(e) => return errors::store_error_to_response(e),
    };
    let results = match store.results_for_message(id).await {
        Ok(r) => r,
        Err(e) => return errors::store_error_to_response(e),
    };
    Json(MessageDetail { message, receipts, results }).into_response()
}

/// Queue a fresh copy of an `error` or `rejected` message. The original stays
/// terminal.
pub async fn replay(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    let id = MessageId::from_uuid(id);
    let store = services.store();
    let original = match store.get_message(id).await {
        Ok(Some(m)) => m,
        Ok(None) => return errors::not_found(format!("message {id}")),
        Err(e) => return errors::store_error_to_response(e),
    };

    match store.get_connection(original.connection_id).await {
        Ok(Some(c)) if c.is_active() => {}
        Ok(Some(c)) => {
            return errors::json_error(
                StatusCode::CONFLICT,
                "connection_inactive",
                format!("connection {} is {}", c.id, c.status.as_str()),
            );
        }
        Ok(None) => return errors::not_found(format!("connection {}", original.connection_id)),
        Err(e) => return errors::store_error_to_response(e),
    }

    let copy = match original.replay(services.writer.max_attempts(), Utc::now()) {
        Ok(copy) => copy,
        Err(e) => return errors::json_error(StatusCode::CONFLICT, "not_replayable", e.to_string()),
    };
    match store.append_message(copy).await {
        Ok(copy) => {
            info!(message_id = %id, replay_id = %copy.id, "message replayed");
            (StatusCode::CREATED, Json(copy)).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}
