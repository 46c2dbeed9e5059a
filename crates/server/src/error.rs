//! Unified error handling with Sentry integration.
//!
//! Every layer has its own `thiserror` enum. Each of them classifies itself
//! into an [`ErrorKind`], which is what callers branch on and what the HTTP
//! boundary turns into a status code.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::db::RepositoryError;
use crate::payments::{CheckoutError, PaymentError, WebhookError};
use crate::services::OrderError;

/// Caller-facing classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Duplicate unpaid order or duplicate unique key. Not retried.
    Conflict,
    /// Illegal transition or precondition. Never coerced into a valid state.
    InvalidState,
    /// Not enough stock for the requested quantity.
    InsufficientStock,
    /// Unknown order, product or cart item.
    NotFound,
    /// Webhook signature missing or wrong.
    Unauthorized,
    /// The payment processor failed or was unreachable. Retryable.
    PaymentGateway,
    /// Storage or programming error.
    Internal,
}

impl ErrorKind {
    /// HTTP status for this kind of error.
    #[must_use]
    pub const fn status_code(self) -> StatusCode {
        match self {
            Self::Conflict | Self::InsufficientStock => StatusCode::CONFLICT,
            Self::InvalidState => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::PaymentGateway => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller may succeed by retrying the same request later.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::PaymentGateway | Self::Internal)
    }
}

impl RepositoryError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Database(_) | Self::DataCorruption(_) => ErrorKind::Internal,
        }
    }
}

/// Application-level error type for HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    /// Order engine or cart operation failed.
    #[error(transparent)]
    Order(#[from] OrderError),

    /// Payment processor call failed.
    #[error("Payment error: {0}")]
    Payment(#[from] PaymentError),

    /// Checkout (preference creation) failed.
    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    /// Webhook reconciliation failed.
    #[error(transparent)]
    Webhook(#[from] WebhookError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] RepositoryError),

    /// Bad request from client.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Order(err) => err.kind(),
            Self::Payment(err) => err.kind(),
            Self::Checkout(err) => err.kind(),
            Self::Webhook(err) => err.kind(),
            Self::Database(err) => err.kind(),
            Self::BadRequest(_) => ErrorKind::InvalidState,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let kind = self.kind();

        // Capture server errors to Sentry
        if matches!(kind, ErrorKind::Internal | ErrorKind::PaymentGateway) {
            let event_id = sentry::capture_error(&self);
            tracing::error!(
                error = %self,
                sentry_event_id = %event_id,
                "Request error"
            );
        }

        // Don't expose internal error details to clients
        let message = match kind {
            ErrorKind::Internal => "Internal server error".to_string(),
            ErrorKind::PaymentGateway => {
                "Payment processor unavailable, please retry".to_string()
            }
            _ => self.to_string(),
        };

        (kind.status_code(), Json(json!({ "error": message }))).into_response()
    }
}

/// Result type alias for `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use kiosk_core::{OrderId, OrderStatus};

    use super::*;

    fn get_status(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_kind_status_codes() {
        assert_eq!(ErrorKind::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::InvalidState.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorKind::InsufficientStock.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(ErrorKind::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorKind::Unauthorized.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ErrorKind::PaymentGateway.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ErrorKind::Internal.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            get_status(AppError::Order(OrderError::OrderNotFound(OrderId::new()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            get_status(AppError::Order(OrderError::InvalidTransition {
                from: OrderStatus::Delivered,
                to: OrderStatus::Pending,
            })),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            get_status(AppError::Webhook(WebhookError::Unauthorized(
                "bad digest".to_string()
            ))),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            get_status(AppError::Payment(PaymentError::Timeout)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            get_status(AppError::Internal("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_repository_error_kinds() {
        assert_eq!(RepositoryError::NotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            RepositoryError::Conflict("dup".to_string()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            RepositoryError::DataCorruption("bad".to_string()).kind(),
            ErrorKind::Internal
        );
    }
}
