//! Payment processor wire types.
//!
//! Request and response bodies of the `MercadoPago` Checkout Pro API, plus
//! the closed classification of external payment statuses.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Preferences
// =============================================================================

/// Body of `POST /checkout/preferences`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreferenceRequest {
    pub items: Vec<PreferenceItem>,
    pub payer: Payer,
    pub back_urls: BackUrls,
    pub auto_return: String,
    pub notification_url: String,
    pub external_reference: String,
    pub statement_descriptor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreferenceItem {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub quantity: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub unit_price: Decimal,
    pub currency_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Payer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

/// A preference as returned by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Preference {
    pub id: String,
    pub init_point: String,
    #[serde(default)]
    pub sandbox_init_point: Option<String>,
    #[serde(default)]
    pub external_reference: Option<String>,
}

// =============================================================================
// Payments
// =============================================================================

/// A payment as returned by `GET /v1/payments/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PaymentRecord {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub status: ProcessorStatus,
    #[serde(default)]
    pub status_detail: Option<String>,
    #[serde(default)]
    pub external_reference: Option<String>,
}

/// Payment ids arrive as JSON numbers; keep them as strings.
fn de_id<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Number(u64),
        Text(String),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Number(n) => n.to_string(),
        Id::Text(s) => s,
    })
}

/// Payment status reported by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ProcessorStatus {
    Approved,
    Rejected,
    Pending,
    InProcess,
    Cancelled,
    Refunded,
    ChargedBack,
    /// A status this service does not model (e.g. `in_mediation`).
    Unrecognized(String),
}

impl From<String> for ProcessorStatus {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            "pending" => Self::Pending,
            "in_process" => Self::InProcess,
            "cancelled" => Self::Cancelled,
            "refunded" => Self::Refunded,
            "charged_back" => Self::ChargedBack,
            _ => Self::Unrecognized(value),
        }
    }
}

impl From<&str> for ProcessorStatus {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl std::fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Pending => "pending",
            Self::InProcess => "in_process",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
            Self::ChargedBack => "charged_back",
            Self::Unrecognized(other) => other,
        })
    }
}

/// What the order engine should do about a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAction {
    Confirm,
    Reject,
    MarkPending,
    MarkCancelled,
    Ignore,
}

impl ProcessorStatus {
    #[must_use]
    pub const fn action(&self) -> PaymentAction {
        match self {
            Self::Approved => PaymentAction::Confirm,
            Self::Rejected => PaymentAction::Reject,
            Self::Pending | Self::InProcess => PaymentAction::MarkPending,
            Self::Cancelled | Self::Refunded | Self::ChargedBack => PaymentAction::MarkCancelled,
            Self::Unrecognized(_) => PaymentAction::Ignore,
        }
    }
}
