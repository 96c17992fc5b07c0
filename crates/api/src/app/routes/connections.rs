use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use regsync_core::ConnectionId;

use crate::app::{errors, services::AppServices};

/// Non-terminal messages of a connection, in enqueue order.
pub async fn open_messages(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    let id = ConnectionId::from_uuid(id);
    match services.store().get_connection(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return errors::not_found(format!("connection {id}")),
        Err(e) => return errors::store_error_to_response(e),
    }
    match services.store().open_messages_for_connection(id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Operator action after fixing credentials: back to `active`, engine halt lifted.
pub async fn reactivate(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    let id = ConnectionId::from_uuid(id);
    match services.store().reactivate_connection(id, Utc::now()).await {
        Ok(connection) => {
            services.engine.resume(id);
            info!(connection_id = %id, tenant_id = %connection.tenant_id, "connection reactivated");
            Json(connection).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}
