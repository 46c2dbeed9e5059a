//! Catalog and customer types consumed by the order core.
//!
//! Products and users are owned by other parts of the store; this crate only
//! reads them, apart from the stock column of the inventory ledger.

use serde::Serialize;

use kiosk_core::{Price, ProductId, UserId};

/// A catalog product with its inventory ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub description: Option<String>,
    pub price: Price,
    /// Units on hand. Never negative.
    pub stock: i32,
    /// Inactive products cannot be added to carts or ordered.
    pub active: bool,
}

impl Product {
    /// Units that can currently be sold.
    ///
    /// Inactive products have nothing available regardless of stock.
    #[must_use]
    pub const fn available(&self) -> i32 {
        if self.active { self.stock } else { 0 }
    }
}

/// The contact details the notifier and payment processor need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Customer {
    pub id: UserId,
    pub name: String,
    pub email: String,
}
