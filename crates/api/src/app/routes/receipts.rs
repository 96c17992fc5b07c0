//! Registry receipt webhook. Feeds the same processor as polling.
//!
//! The webhook is an outside caller, so a receipt that cannot be applied is
//! refused and alerted on by the reconciler; it never halts the connection.

use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use tracing::{info, warn};

use regsync_infra::EngineError;
use regsync_outbox::InboundReceipt;

use crate::app::{dto::ReceiptAck, errors, services::AppServices};

pub async fn webhook(
    Extension(services): Extension<Arc<AppServices>>,
    Json(receipt): Json<InboundReceipt>,
) -> axum::response::Response {
    let message_id = receipt.message_id;
    let message = match services.store().get_message(message_id).await {
        Ok(Some(m)) => m,
        Ok(None) => return errors::not_found(format!("message {message_id}")),
        Err(e) => return errors::store_error_to_response(e),
    };

    match services.processor.process(receipt, Utc::now()).await {
        Ok(outcome) => {
            let ack = ReceiptAck::from(&outcome);
            info!(%message_id, outcome = ack.outcome, "webhook receipt processed");
            (StatusCode::OK, Json(ack)).into_response()
        }
        Err(err @ (EngineError::Fault(_) | EngineError::Domain(_))) => {
            warn!(%message_id, connection_id = %message.connection_id, error = %err, "webhook receipt refused");
            errors::json_error(StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_receipt", err.to_string())
        }
        Err(err) => errors::engine_error_to_response(err),
    }
}
