//! Cart domain types.

use serde::{Deserialize, Serialize};

use kiosk_core::{CartId, CartItemId, Price, ProductId, UserId};

use super::Product;

/// A user's cart with current product snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cart {
    pub id: CartId,
    pub user_id: UserId,
    pub lines: Vec<CartLine>,
}

/// One product in a cart. At most one line exists per product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartLine {
    pub id: CartItemId,
    pub product: Product,
    pub quantity: i32,
}

impl CartLine {
    /// Price of this line at the current catalog price.
    #[must_use]
    pub fn line_total(&self) -> Price {
        self.product.price.times(self.quantity)
    }
}

impl Cart {
    /// Whether the cart has no lines.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Find the line holding `product_id`.
    #[must_use]
    pub fn line_for_product(&self, product_id: ProductId) -> Option<&CartLine> {
        self.lines.iter().find(|line| line.product.id == product_id)
    }

    /// Find a line by its item id.
    #[must_use]
    pub fn line(&self, item_id: CartItemId) -> Option<&CartLine> {
        self.lines.iter().find(|line| line.id == item_id)
    }
}

/// Cart with computed totals, as shown to the shopper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartView {
    pub cart_id: CartId,
    pub lines: Vec<CartLine>,
    /// Sum of line quantities.
    pub total_items: i64,
    /// Sum of line totals at current catalog prices.
    pub total_price: Price,
}

impl From<Cart> for CartView {
    fn from(cart: Cart) -> Self {
        let total_items = cart.lines.iter().map(|line| i64::from(line.quantity)).sum();
        let total_price = cart.lines.iter().map(CartLine::line_total).sum();
        Self {
            cart_id: cart.id,
            lines: cart.lines,
            total_items,
            total_price,
        }
    }
}

/// A line of a client-side cart submitted for merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSyncLine {
    pub product_id: ProductId,
    pub quantity: i32,
}
