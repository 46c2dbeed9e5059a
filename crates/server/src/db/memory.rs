//! Process-local store.
//!
//! Backs tests and local development. A unit of work holds an exclusive lock
//! on the whole state and mutates a working copy, which replaces the shared
//! state on commit. Dropping the unit of work discards the copy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use kiosk_core::{CartId, CartItemId, OrderId, ProductId, UserId};

use super::{RepositoryError, Store, UnitOfWork};
use crate::models::{Cart, CartLine, Customer, Order, OrderFilter, OrderStateUpdate, Product};

#[derive(Debug, Clone, Default)]
struct State {
    customers: HashMap<UserId, Customer>,
    products: HashMap<ProductId, Product>,
    carts: HashMap<UserId, CartRecord>,
    orders: HashMap<OrderId, Order>,
    failing_orders: HashSet<OrderId>,
}

#[derive(Debug, Clone)]
struct CartRecord {
    id: CartId,
    items: Vec<CartItemRecord>,
}

#[derive(Debug, Clone, Copy)]
struct CartItemRecord {
    id: CartItemId,
    product_id: ProductId,
    quantity: i32,
}

impl State {
    fn cart_view(&self, user_id: UserId) -> Option<Cart> {
        let record = self.carts.get(&user_id)?;
        let lines = record
            .items
            .iter()
            .filter_map(|item| {
                self.products.get(&item.product_id).map(|product| CartLine {
                    id: item.id,
                    product: product.clone(),
                    quantity: item.quantity,
                })
            })
            .collect();
        Some(Cart {
            id: record.id,
            user_id,
            lines,
        })
    }

    fn unpaid_order_of(&self, user_id: UserId) -> Option<OrderId> {
        self.orders
            .values()
            .find(|order| order.user_id == user_id && order.is_awaiting_payment())
            .map(|order| order.id)
    }

    fn cart_item_mut(&mut self, item_id: CartItemId) -> Option<&mut CartItemRecord> {
        self.carts
            .values_mut()
            .flat_map(|cart| cart.items.iter_mut())
            .find(|item| item.id == item_id)
    }
}

/// In-memory implementation of [`Store`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a customer.
    pub async fn insert_customer(&self, customer: Customer) {
        self.state
            .lock()
            .await
            .customers
            .insert(customer.id, customer);
    }

    /// Add or replace a product.
    pub async fn insert_product(&self, product: Product) {
        self.state.lock().await.products.insert(product.id, product);
    }

    /// Make every later status write for `order_id` fail.
    ///
    /// Lets callers exercise the per-order error handling of batch jobs.
    pub async fn inject_write_failure(&self, order_id: OrderId) {
        self.state.lock().await.failing_orders.insert(order_id);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, RepositoryError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, working }))
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        Ok(self.state.lock().await.orders.get(&id).cloned())
    }

    async fn find_product(&self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        Ok(self.state.lock().await.products.get(&id).cloned())
    }

    async fn find_customer(&self, id: UserId) -> Result<Option<Customer>, RepositoryError> {
        Ok(self.state.lock().await.customers.get(&id).cloned())
    }

    async fn list_user_orders(
        &self,
        user_id: UserId,
        filter: &OrderFilter,
    ) -> Result<(Vec<Order>, u64), RepositoryError> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|order| order.user_id == user_id)
            .filter(|order| filter.status.is_none_or(|status| order.status == status))
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = orders.len() as u64;
        let offset = usize::try_from(filter.offset()).unwrap_or(usize::MAX);
        let page = orders
            .into_iter()
            .skip(offset)
            .take(filter.limit() as usize)
            .collect();
        Ok((page, total))
    }

    async fn find_expired_orders(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<OrderId>, RepositoryError> {
        let state = self.state.lock().await;
        let mut expired: Vec<&Order> = state
            .orders
            .values()
            .filter(|order| order.is_awaiting_payment() && order.created_at < cutoff)
            .collect();
        expired.sort_by_key(|order| order.created_at);
        Ok(expired.into_iter().map(|order| order.id).collect())
    }

    async fn set_preference_id(
        &self,
        order_id: OrderId,
        preference_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(RepositoryError::NotFound)?;
        order.preference_id = Some(preference_id.to_string());
        order.updated_at = updated_at;
        Ok(())
    }
}

struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<State>,
    working: State,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        Ok(self.working.orders.get(&id).cloned())
    }

    async fn lock_cart(&mut self, user_id: UserId) -> Result<Cart, RepositoryError> {
        self.working
            .carts
            .entry(user_id)
            .or_insert_with(|| CartRecord {
                id: CartId::new(),
                items: Vec::new(),
            });
        self.working
            .cart_view(user_id)
            .ok_or(RepositoryError::NotFound)
    }

    async fn lock_product(&mut self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        Ok(self.working.products.get(&id).cloned())
    }

    async fn find_unpaid_order(
        &mut self,
        user_id: UserId,
    ) -> Result<Option<OrderId>, RepositoryError> {
        Ok(self.working.unpaid_order_of(user_id))
    }

    async fn upsert_cart_item(
        &mut self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<CartItemId, RepositoryError> {
        let cart = self
            .working
            .carts
            .values_mut()
            .find(|cart| cart.id == cart_id)
            .ok_or(RepositoryError::NotFound)?;

        if let Some(item) = cart
            .items
            .iter_mut()
            .find(|item| item.product_id == product_id)
        {
            item.quantity = quantity;
            return Ok(item.id);
        }

        let id = CartItemId::new();
        cart.items.push(CartItemRecord {
            id,
            product_id,
            quantity,
        });
        Ok(id)
    }

    async fn set_cart_item_quantity(
        &mut self,
        item_id: CartItemId,
        quantity: i32,
    ) -> Result<(), RepositoryError> {
        let item = self
            .working
            .cart_item_mut(item_id)
            .ok_or(RepositoryError::NotFound)?;
        item.quantity = quantity;
        Ok(())
    }

    async fn delete_cart_item(&mut self, item_id: CartItemId) -> Result<(), RepositoryError> {
        for cart in self.working.carts.values_mut() {
            cart.items.retain(|item| item.id != item_id);
        }
        Ok(())
    }

    async fn clear_cart(&mut self, user_id: UserId) -> Result<u64, RepositoryError> {
        Ok(self
            .working
            .carts
            .get_mut(&user_id)
            .map_or(0, |cart| cart.items.drain(..).count() as u64))
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), RepositoryError> {
        if order.is_awaiting_payment() && self.working.unpaid_order_of(order.user_id).is_some() {
            return Err(RepositoryError::Conflict(format!(
                "user {} already has an unpaid order",
                order.user_id
            )));
        }
        if self.working.orders.contains_key(&order.id) {
            return Err(RepositoryError::Conflict(format!(
                "order {} already exists",
                order.id
            )));
        }
        self.working.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn decrement_stock(
        &mut self,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<bool, RepositoryError> {
        let product = self
            .working
            .products
            .get_mut(&product_id)
            .ok_or(RepositoryError::NotFound)?;
        if product.stock < quantity {
            return Ok(false);
        }
        product.stock -= quantity;
        Ok(true)
    }

    async fn increment_stock(
        &mut self,
        product_id: ProductId,
        quantity: i32,
    ) -> Result<(), RepositoryError> {
        let product = self
            .working
            .products
            .get_mut(&product_id)
            .ok_or(RepositoryError::NotFound)?;
        product.stock = product.stock.saturating_add(quantity);
        Ok(())
    }

    async fn update_order_state(
        &mut self,
        order_id: OrderId,
        update: &OrderStateUpdate,
    ) -> Result<(), RepositoryError> {
        if self.working.failing_orders.contains(&order_id) {
            return Err(RepositoryError::DataCorruption(format!(
                "injected write failure for order {order_id}"
            )));
        }
        let order = self
            .working
            .orders
            .get_mut(&order_id)
            .ok_or(RepositoryError::NotFound)?;
        order.status = update.status;
        order.payment_status = update.payment_status;
        if let Some(payment_id) = &update.payment_id {
            order.payment_id = Some(payment_id.clone());
        }
        order.updated_at = update.updated_at;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        let Self { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}
