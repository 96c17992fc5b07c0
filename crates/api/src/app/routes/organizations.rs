use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use regsync_core::TenantId;
use regsync_outbox::MessageStatus;

use crate::app::{dto::ListQuery, errors, services::AppServices};

pub async fn error_messages(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> axum::response::Response {
    let tenant_id = TenantId::from_uuid(id);
    match services
        .store()
        .messages_by_status(tenant_id, MessageStatus::Error, query.limit())
        .await
    {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn latest_drift(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    let tenant_id = TenantId::from_uuid(id);
    match services.store().latest_drift_report(tenant_id).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => errors::not_found(format!("drift report for organization {tenant_id}")),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<Uuid>,
) -> axum::response::Response {
    match services.store().message_stats(TenantId::from_uuid(id)).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
