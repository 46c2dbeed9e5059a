//! Payment processor errors.

use thiserror::Error;

use crate::error::ErrorKind;

/// Errors that can occur when talking to the payment processor.
#[derive(Debug, Error)]
pub enum PaymentError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[source] reqwest::Error),

    /// The processor did not answer within the configured timeout.
    #[error("payment processor timed out")]
    Timeout,

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Failed to parse response.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Unauthorized (invalid access token).
    #[error("Unauthorized: invalid access token")]
    Unauthorized,
}

impl From<reqwest::Error> for PaymentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(err)
        }
    }
}

impl PaymentError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::PaymentGateway,
        }
    }

    /// The processor no longer knows the resource, or refuses it as invalid.
    ///
    /// Transport failures and server errors are not stale: they say nothing
    /// about the resource itself.
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Api { status, .. } => *status >= 400 && *status < 500 && *status != 429,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            PaymentError::NotFound("p".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(PaymentError::Timeout.kind(), ErrorKind::PaymentGateway);
        assert!(ErrorKind::PaymentGateway.is_retryable());
    }

    #[test]
    fn test_staleness() {
        assert!(PaymentError::NotFound("pref".to_string()).is_stale());
        assert!(
            PaymentError::Api {
                status: 400,
                message: "expired".to_string()
            }
            .is_stale()
        );
        assert!(
            !PaymentError::Api {
                status: 429,
                message: "slow down".to_string()
            }
            .is_stale()
        );
        assert!(
            !PaymentError::Api {
                status: 503,
                message: "down".to_string()
            }
            .is_stale()
        );
        assert!(!PaymentError::Timeout.is_stale());
    }
}
