//! Order and payment status machines.
//!
//! An order carries two independent statuses: the fulfilment [`OrderStatus`]
//! driven by the store, and the [`PaymentStatus`] driven by the payment
//! processor. Both enums own their transition tables so that every caller
//! (webhooks, admins, the sweeper) is held to the same rules.

use serde::{Deserialize, Serialize};

/// Error returned when a status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseStatusError {
    kind: &'static str,
    value: String,
}

/// Fulfilment status of an order.
///
/// ```text
/// PENDING   -> CONFIRMED | CANCELLED
/// CONFIRMED -> SHIPPED   | CANCELLED
/// SHIPPED   -> DELIVERED
/// DELIVERED -> (terminal)
/// CANCELLED -> (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "order_status", rename_all = "snake_case")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Confirmed,
        Self::Shipped,
        Self::Delivered,
        Self::Cancelled,
    ];

    /// Statuses reachable from `self` in one step.
    #[must_use]
    pub const fn next_states(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Confirmed, Self::Cancelled],
            Self::Confirmed => &[Self::Shipped, Self::Cancelled],
            Self::Shipped => &[Self::Delivered],
            Self::Delivered | Self::Cancelled => &[],
        }
    }

    /// Whether the transition `self -> next` is in the table.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.next_states().contains(&next)
    }

    /// Terminal statuses accept no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    /// Storage / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    /// Customer-facing label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Confirmed => "Confirmed",
            Self::Shipped => "Shipped",
            Self::Delivered => "Delivered",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseStatusError {
                kind: "order status",
                value: s.to_string(),
            })
    }
}

/// Payment status of an order, as last reported by the processor.
///
/// ```text
/// PENDING   -> PENDING | APPROVED | REJECTED | CANCELLED
/// REJECTED  -> PENDING | APPROVED | REJECTED | CANCELLED   (buyer retried)
/// CANCELLED -> PENDING | APPROVED | REJECTED | CANCELLED   (new attempt)
/// APPROVED  -> CANCELLED                                  (refund/chargeback)
/// ```
///
/// `APPROVED -> APPROVED` is deliberately absent: approval decrements stock,
/// so a second approval must be refused rather than re-applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "payment_status", rename_all = "snake_case")
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl PaymentStatus {
    /// Every status.
    pub const ALL: [Self; 4] = [
        Self::Pending,
        Self::Approved,
        Self::Rejected,
        Self::Cancelled,
    ];

    /// Statuses reachable from `self` in one step.
    #[must_use]
    pub const fn next_states(self) -> &'static [Self] {
        match self {
            Self::Pending | Self::Rejected | Self::Cancelled => &[
                Self::Pending,
                Self::Approved,
                Self::Rejected,
                Self::Cancelled,
            ],
            Self::Approved => &[Self::Cancelled],
        }
    }

    /// Whether the transition `self -> next` is in the table.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        self.next_states().contains(&next)
    }

    /// Storage / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseStatusError {
                kind: "payment status",
                value: s.to_string(),
            })
    }
}
