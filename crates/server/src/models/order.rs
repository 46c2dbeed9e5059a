//! Order domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use kiosk_core::{OrderId, OrderItemId, OrderStatus, PaymentStatus, Price, ProductId, UserId};

/// Default page size for order listings.
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// Largest page size a caller may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// A persisted order.
///
/// `items` and `total` are a snapshot taken at checkout and never change
/// afterwards, whatever happens to catalog prices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
    pub total: Price,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    /// Processor preference (hosted checkout) id.
    pub preference_id: Option<String>,
    /// Processor payment id of the last reconciled payment.
    pub payment_id: Option<String>,
    pub shipping_address: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Still waiting for a first payment: `PENDING/PENDING`.
    #[must_use]
    pub fn is_awaiting_payment(&self) -> bool {
        self.status == OrderStatus::Pending && self.payment_status == PaymentStatus::Pending
    }

    /// Stock was decremented for this order and has not been given back.
    #[must_use]
    pub fn holds_stock(&self) -> bool {
        self.payment_status == PaymentStatus::Approved
    }
}

/// A line of an order with the price captured at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderItem {
    pub id: OrderItemId,
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: Price,
}

impl OrderItem {
    #[must_use]
    pub fn line_total(&self) -> Price {
        self.unit_price.times(self.quantity)
    }
}

/// Optional details supplied at checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutMetadata {
    pub shipping_address: Option<String>,
    pub notes: Option<String>,
}

/// The status columns written by a single state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderStateUpdate {
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    /// `None` keeps the stored payment id.
    pub payment_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Listing filter for a user's orders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct OrderFilter {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<OrderStatus>,
}

impl OrderFilter {
    /// One-based page number.
    #[must_use]
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    /// Page size, clamped to `1..=MAX_PAGE_SIZE`.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    /// Rows to skip before this page.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.page() - 1) * u64::from(self.limit())
    }
}

/// Pagination details returned with a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

impl PageMeta {
    #[must_use]
    pub fn new(total: u64, filter: &OrderFilter) -> Self {
        let limit = filter.limit();
        Self {
            total,
            page: filter.page(),
            limit,
            total_pages: total.div_ceil(u64::from(limit)),
        }
    }
}

/// A page of orders, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    pub meta: PageMeta,
}

/// Payment-facing summary of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentSnapshot {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_id: Option<String>,
    pub preference_id: Option<String>,
}

impl From<&Order> for PaymentSnapshot {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id,
            status: order.status,
            payment_status: order.payment_status,
            payment_id: order.payment_id.clone(),
            preference_id: order.preference_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_defaults() {
        let filter = OrderFilter::default();
        assert_eq!(filter.page(), 1);
        assert_eq!(filter.limit(), DEFAULT_PAGE_SIZE);
        assert_eq!(filter.offset(), 0);
    }

    #[test]
    fn test_filter_clamps() {
        let filter = OrderFilter {
            page: Some(0),
            limit: Some(1_000),
            status: None,
        };
        assert_eq!(filter.page(), 1);
        assert_eq!(filter.limit(), MAX_PAGE_SIZE);

        let filter = OrderFilter {
            page: Some(3),
            limit: Some(0),
            status: None,
        };
        assert_eq!(filter.limit(), 1);
        assert_eq!(filter.offset(), 2);
    }

    #[test]
    fn test_page_meta_rounds_up() {
        let filter = OrderFilter {
            page: Some(2),
            limit: Some(10),
            status: None,
        };
        let meta = PageMeta::new(21, &filter);
        assert_eq!(meta.total_pages, 3);
        assert_eq!(meta.page, 2);

        assert_eq!(PageMeta::new(0, &filter).total_pages, 0);
    }
}
