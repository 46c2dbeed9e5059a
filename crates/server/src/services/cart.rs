//! Cart store.
//!
//! One cart per user, created on first access. Quantities are bounded by the
//! stock on hand when they are written; the order engine checks stock again
//! at checkout and at payment approval.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::instrument;

use kiosk_core::{CartItemId, ProductId, UserId};

use crate::db::{Store, UnitOfWork};
use crate::models::{Cart, CartSyncLine, CartView, Product};
use crate::services::OrderError;

/// Per-user shopping carts.
#[derive(Clone)]
pub struct CartService {
    store: Arc<dyn Store>,
}

impl CartService {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The user's cart with totals.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn get_cart(&self, user_id: UserId) -> Result<CartView, OrderError> {
        let mut uow = self.store.begin().await?;
        let cart = uow.lock_cart(user_id).await?;
        uow.commit().await?;
        Ok(cart.into())
    }

    /// Add `quantity` units of a product, merging with an existing line.
    ///
    /// # Errors
    ///
    /// - `InvalidQuantity` if `quantity < 1`
    /// - `ProductNotFound` for unknown products
    /// - `InsufficientStock` if the merged quantity exceeds available stock
    #[instrument(skip(self), fields(user_id = %user_id, product_id = %product_id))]
    pub async fn add_item(
        &self,
        user_id: UserId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<CartView, OrderError> {
        require_quantity(quantity)?;

        let mut uow = self.store.begin().await?;
        let cart = uow.lock_cart(user_id).await?;
        let product = uow
            .lock_product(product_id)
            .await?
            .ok_or(OrderError::ProductNotFound(product_id))?;

        let existing = cart
            .line_for_product(product_id)
            .map_or(0, |line| line.quantity);
        let requested = existing
            .checked_add(quantity)
            .ok_or(OrderError::InvalidQuantity(quantity))?;
        require_stock(&product, requested)?;

        uow.upsert_cart_item(cart.id, product_id, requested).await?;
        finish(uow, user_id).await
    }

    /// Set the quantity of one of the user's cart lines.
    ///
    /// # Errors
    ///
    /// - `InvalidQuantity` if `quantity < 1`
    /// - `CartItemNotFound` if the line is not in the user's cart
    /// - `InsufficientStock` if `quantity` exceeds available stock
    #[instrument(skip(self), fields(user_id = %user_id, item_id = %item_id))]
    pub async fn update_item(
        &self,
        user_id: UserId,
        item_id: CartItemId,
        quantity: i32,
    ) -> Result<CartView, OrderError> {
        require_quantity(quantity)?;

        let mut uow = self.store.begin().await?;
        let cart = uow.lock_cart(user_id).await?;
        let line = cart
            .line(item_id)
            .ok_or(OrderError::CartItemNotFound(item_id))?;
        let product = uow
            .lock_product(line.product.id)
            .await?
            .ok_or(OrderError::ProductNotFound(line.product.id))?;
        require_stock(&product, quantity)?;

        uow.set_cart_item_quantity(item_id, quantity).await?;
        finish(uow, user_id).await
    }

    /// Remove one line from the user's cart.
    ///
    /// # Errors
    ///
    /// `CartItemNotFound` if the line is not in the user's cart.
    pub async fn remove_item(
        &self,
        user_id: UserId,
        item_id: CartItemId,
    ) -> Result<CartView, OrderError> {
        let mut uow = self.store.begin().await?;
        let cart = uow.lock_cart(user_id).await?;
        if cart.line(item_id).is_none() {
            return Err(OrderError::CartItemNotFound(item_id));
        }

        uow.delete_cart_item(item_id).await?;
        finish(uow, user_id).await
    }

    /// Empty the user's cart.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn clear(&self, user_id: UserId) -> Result<CartView, OrderError> {
        let mut uow = self.store.begin().await?;
        uow.lock_cart(user_id).await?;
        uow.clear_cart(user_id).await?;
        finish(uow, user_id).await
    }

    /// Merge a client-side cart into the stored one.
    ///
    /// Unknown and inactive products are skipped. Each product ends up with
    /// `min(max(stored, incoming), stock)` units; lines that would end up
    /// with nothing are skipped.
    ///
    /// # Errors
    ///
    /// Storage errors.
    #[instrument(skip(self, lines), fields(user_id = %user_id, lines = lines.len()))]
    pub async fn sync(
        &self,
        user_id: UserId,
        lines: &[CartSyncLine],
    ) -> Result<CartView, OrderError> {
        let mut uow = self.store.begin().await?;
        let cart = uow.lock_cart(user_id).await?;

        let mut quantities: HashMap<ProductId, i32> = cart
            .lines
            .iter()
            .map(|line| (line.product.id, line.quantity))
            .collect();

        for incoming in lines {
            if incoming.quantity < 1 {
                continue;
            }
            let Some(product) = uow.lock_product(incoming.product_id).await? else {
                tracing::debug!(product_id = %incoming.product_id, "Skipping unknown product");
                continue;
            };
            if !product.active {
                continue;
            }

            let stored = quantities.get(&product.id).copied().unwrap_or(0);
            let target = stored.max(incoming.quantity).min(product.stock);
            if target < 1 || target == stored {
                continue;
            }

            uow.upsert_cart_item(cart.id, product.id, target).await?;
            quantities.insert(product.id, target);
        }

        finish(uow, user_id).await
    }
}

/// Reload the cart, commit, and build the view.
async fn finish(mut uow: Box<dyn UnitOfWork>, user_id: UserId) -> Result<CartView, OrderError> {
    let cart: Cart = uow.lock_cart(user_id).await?;
    uow.commit().await?;
    Ok(cart.into())
}

const fn require_quantity(quantity: i32) -> Result<(), OrderError> {
    if quantity < 1 {
        return Err(OrderError::InvalidQuantity(quantity));
    }
    Ok(())
}

fn require_stock(product: &Product, requested: i32) -> Result<(), OrderError> {
    let available = product.available();
    if available < requested {
        return Err(OrderError::InsufficientStock {
            product_id: product.id,
            product_name: product.name.clone(),
            available,
            requested,
        });
    }
    Ok(())
}
