//! Storage for the order core.
//!
//! # Tables
//!
//! - `users` - Customers (read-only here)
//! - `products` - Catalog entries and the stock ledger
//! - `carts` / `cart_items` - One cart per user, one line per product
//! - `orders` / `order_items` - Orders and their price snapshots
//!
//! # Units of work
//!
//! Every mutation that touches more than one row goes through a
//! [`UnitOfWork`]: a transactional handle that is either committed as a
//! whole or rolled back as a whole. Dropping a unit of work without calling
//! [`UnitOfWork::commit`] rolls it back. Rows read through a unit of work
//! are locked until it ends, so check-then-act sequences inside one unit of
//! work cannot interleave with another writer.
//!
//! # Migrations
//!
//! Migrations are stored in `crates/server/migrations/` and run via:
//! ```bash
//! cargo run -p kiosk-cli -- migrate
//! ```

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use kiosk_core::{CartId, CartItemId, OrderId, ProductId, UserId};

use crate::models::{Cart, Customer, Order, OrderFilter, OrderStateUpdate, Product};

pub use memory::MemoryStore;
pub use postgres::{PgStore, create_pool};

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation (e.g., a second unpaid order for a user).
    #[error("constraint violation: {0}")]
    Conflict(String),
}

/// Read paths and the entry point for transactional writes.
#[async_trait]
pub trait Store: Send + Sync {
    /// Start a unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, RepositoryError>;

    /// Check that the backing store is reachable.
    async fn ping(&self) -> Result<(), RepositoryError>;

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>, RepositoryError>;

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>, RepositoryError>;

    async fn find_customer(&self, id: UserId) -> Result<Option<Customer>, RepositoryError>;

    /// A page of a user's orders, newest first, with the unpaged total.
    async fn list_user_orders(
        &self,
        user_id: UserId,
        filter: &OrderFilter,
    ) -> Result<(Vec<Order>, u64), RepositoryError>;

    /// Ids of `PENDING/PENDING` orders created strictly before `cutoff`.
    async fn find_expired_orders(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OrderId>, RepositoryError>;

    /// Record the processor preference created for an order.
    async fn set_preference_id(
        &self,
        order_id: OrderId,
        preference_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

/// A transactional handle.
///
/// Methods named `lock_*` return rows that stay locked until the unit of
/// work ends.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Lock and load an order with its items.
    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, RepositoryError>;

    /// Lock and load the user's cart, creating it on first access.
    ///
    /// Holding the cart lock serializes checkouts of the same user.
    async fn lock_cart(&mut self, user_id: UserId) -> Result<Cart, RepositoryError>;

    /// Lock and load a product.
    async fn lock_product(&mut self, id: ProductId) -> Result<Option<Product>, RepositoryError>;

    /// The user's `PENDING/PENDING` order, if any.
    async fn find_unpaid_order(&mut self, user_id: UserId)
    -> Result<Option<OrderId>, RepositoryError>;

    /// Insert a cart line, or overwrite the quantity of the existing line
    /// for the same product.
    async fn upsert_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<CartItemId, RepositoryError>;

    async fn set_cart_item_quantity(
        &mut self,
        item_id: CartItemId,
        quantity: i32,
    ) -> Result<(), RepositoryError>;

    async fn delete_cart_item(&mut self, item_id: CartItemId) -> Result<(), RepositoryError>;

    /// Delete every line of the user's cart. Returns the number removed.
    async fn clear_cart(&mut self, user_id: UserId) -> Result<u64, RepositoryError>;

    /// Persist a new order and its items.
    ///
    /// Fails with [`RepositoryError::Conflict`] if the user already has a
    /// `PENDING/PENDING` order.
    async fn insert_order(&mut self, order: &Order) -> Result<(), RepositoryError>;

    /// Decrement stock by `quantity` only if at least `quantity` is on hand.
    ///
    /// Returns `false`, leaving stock untouched, when there is not enough.
    async fn decrement_stock(
        &mut self,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<bool, RepositoryError>;

    async fn increment_stock(
        &mut self,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<(), RepositoryError>;

    /// Write new status columns for an order.
    async fn update_order_state(
        &mut self,
        order_id: OrderId,
        update: &OrderStateUpdate,
    ) -> Result<(), RepositoryError>;

    /// Make every change of this unit of work durable.
    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;
}
