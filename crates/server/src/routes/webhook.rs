//! Inbound payment notifications.

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
};
use serde::Serialize;

use crate::error::Result;
use crate::payments::{WebhookNotification, WebhookOutcome, WebhookQuery};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "x-signature";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Acknowledgement body.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Receive a processor notification.
///
/// Anything the reconciler acknowledges gets a 200 so the processor stops
/// retrying; errors map through [`crate::error::AppError`].
pub async fn receive(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
    };
    let notification = WebhookNotification::new(
        query,
        &body,
        header(SIGNATURE_HEADER),
        header(REQUEST_ID_HEADER),
    );

    let outcome = state.reconciler().handle(&notification).await?;
    tracing::debug!(outcome = ?outcome, "Webhook handled");

    let warning = match outcome {
        WebhookOutcome::PaymentNotFound { payment_id } => {
            Some(format!("payment {payment_id} not found"))
        }
        _ => None,
    };

    Ok(Json(WebhookAck {
        received: true,
        warning,
    }))
}
