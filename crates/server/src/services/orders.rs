//! Order engine.
//!
//! Turns carts into orders and moves orders through their status machines.
//! Stock is only decremented when a payment is approved and only given back
//! when an approved order is cancelled, so an unpaid order never holds
//! inventory.
//!
//! Every state change loads the order through a [`UnitOfWork`] (which locks
//! it), checks its preconditions against the locked row, applies all of its
//! effects, and commits. Two callers racing on the same order therefore see
//! each other's result: the loser's precondition fails instead of its effect
//! being applied twice.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use kiosk_core::{
    CartItemId, OrderId, OrderItemId, OrderStatus, PaymentStatus, Price, ProductId, UserId,
};

use crate::clock::Clock;
use crate::db::{RepositoryError, Store, UnitOfWork};
use crate::error::ErrorKind;
use crate::models::{
    CheckoutMetadata, Order, OrderFilter, OrderItem, OrderPage, OrderStateUpdate, PageMeta,
    PaymentSnapshot,
};
use crate::services::notifier::{Notifier, OrderNotice};

/// Errors raised by the order engine and the cart store.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The user already has an order waiting for payment.
    #[error("order {blocking} is still awaiting payment")]
    PendingOrderExists { blocking: OrderId },

    #[error("cart is empty")]
    EmptyCart,

    /// Order status change not in the transition table.
    #[error("cannot change order status from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    /// Payment status change not in the transition table.
    #[error("cannot change payment status from {from} to {to}")]
    InvalidPaymentTransition {
        from: PaymentStatus,
        to: PaymentStatus,
    },

    /// The order cannot be confirmed before its payment is approved.
    #[error("order {0} cannot be confirmed: payment is not approved")]
    PaymentNotApproved(OrderId),

    /// Only pending orders can be cancelled by their owner.
    #[error("order {order_id} cannot be cancelled in status {status}")]
    NotCancellable {
        order_id: OrderId,
        status: OrderStatus,
    },

    #[error("insufficient stock for {product_name}: {available} available, {requested} requested")]
    InsufficientStock {
        product_id: ProductId,
        product_name: String,
        available: i32,
        requested: i32,
    },

    #[error("order {0} not found")]
    OrderNotFound(OrderId),

    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("cart item {0} not found")]
    CartItemNotFound(CartItemId),

    #[error("quantity must be at least 1 (got {0})")]
    InvalidQuantity(i32),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl OrderError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PendingOrderExists { .. } => ErrorKind::Conflict,
            Self::EmptyCart
            | Self::InvalidTransition { .. }
            | Self::InvalidPaymentTransition { .. }
            | Self::PaymentNotApproved(_)
            | Self::NotCancellable { .. }
            | Self::InvalidQuantity(_) => ErrorKind::InvalidState,
            Self::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            Self::OrderNotFound(_) | Self::ProductNotFound(_) | Self::CartItemNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::Repository(err) => err.kind(),
        }
    }

    /// The order already has an approved payment.
    #[must_use]
    pub const fn is_already_approved(&self) -> bool {
        matches!(
            self,
            Self::InvalidPaymentTransition {
                from: PaymentStatus::Approved,
                to: PaymentStatus::Approved,
            }
        )
    }
}

/// Creates orders and drives them through their lifecycle.
#[derive(Clone)]
pub struct OrderEngine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    /// In-flight notifications.
    tasks: TaskTracker,
}

impl OrderEngine {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            notifier,
            clock,
            tasks: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // =========================================================================
    // Checkout
    // =========================================================================

    /// Create a `PENDING/PENDING` order from the user's cart.
    ///
    /// Prices are snapshotted from the catalog. Neither stock nor the cart is
    /// touched; both wait for payment approval.
    ///
    /// # Errors
    ///
    /// - `PendingOrderExists` if the user already has an unpaid order
    /// - `EmptyCart` if the cart has no lines
    /// - `InsufficientStock` for the first line that cannot be fulfilled
    #[instrument(skip(self, metadata), fields(user_id = %user_id))]
    pub async fn create_from_cart(
        &self,
        user_id: UserId,
        metadata: CheckoutMetadata,
    ) -> Result<Order, OrderError> {
        let mut uow = self.store.begin().await?;

        // Locking the cart first serializes concurrent checkouts of this user.
        let cart = uow.lock_cart(user_id).await?;

        if let Some(blocking) = uow.find_unpaid_order(user_id).await? {
            return Err(OrderError::PendingOrderExists { blocking });
        }
        if cart.is_empty() {
            return Err(OrderError::EmptyCart);
        }

        for line in &cart.lines {
            let available = line.product.available();
            if available < line.quantity {
                return Err(OrderError::InsufficientStock {
                    product_id: line.product.id,
                    product_name: line.product.name.clone(),
                    available,
                    requested: line.quantity,
                });
            }
        }

        let items: Vec<OrderItem> = cart
            .lines
            .iter()
            .map(|line| OrderItem {
                id: OrderItemId::new(),
                product_id: line.product.id,
                product_name: line.product.name.clone(),
                quantity: line.quantity,
                unit_price: line.product.price,
            })
            .collect();
        let total: Price = items.iter().map(OrderItem::line_total).sum();
        let now = self.clock.now();

        let order = Order {
            id: OrderId::new(),
            user_id,
            items,
            total,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            preference_id: None,
            payment_id: None,
            shipping_address: non_empty(metadata.shipping_address),
            notes: non_empty(metadata.notes),
            created_at: now,
            updated_at: now,
        };

        // A concurrent checkout that slipped past the check above surfaces
        // here as `RepositoryError::Conflict`.
        uow.insert_order(&order).await?;
        uow.commit().await?;

        tracing::info!(order_id = %order.id, total = %order.total, "Order created");
        Ok(order)
    }

    // =========================================================================
    // Payment transitions
    // =========================================================================

    /// Record an approved payment.
    ///
    /// In one unit of work: decrements stock for every item, clears the
    /// user's cart, and sets the order to `CONFIRMED/APPROVED`.
    ///
    /// # Errors
    ///
    /// - `InvalidPaymentTransition` if the payment is already approved
    ///   (duplicate delivery)
    /// - `InvalidTransition` if the order is past `PENDING` (late delivery)
    /// - `InsufficientStock` if stock ran out since checkout; nothing changes
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn confirm_payment(
        &self,
        order_id: OrderId,
        payment_id: &str,
    ) -> Result<Order, OrderError> {
        let mut uow = self.store.begin().await?;
        let order = lock_order(uow.as_mut(), order_id).await?;

        require_payment_transition(&order, PaymentStatus::Approved)?;
        require_transition(&order, OrderStatus::Confirmed)?;

        for item in &order.items {
            if !uow.decrement_stock(item.product_id, item.quantity).await? {
                let available = uow
                    .lock_product(item.product_id)
                    .await?
                    .map_or(0, |product| product.stock);
                return Err(OrderError::InsufficientStock {
                    product_id: item.product_id,
                    product_name: item.product_name.clone(),
                    available,
                    requested: item.quantity,
                });
            }
        }
        let cleared = uow.clear_cart(order.user_id).await?;

        let order = self
            .apply_state(
                uow,
                order,
                OrderStatus::Confirmed,
                PaymentStatus::Approved,
                Some(payment_id),
            )
            .await?;

        tracing::info!(
            order_id = %order.id,
            payment_id = %payment_id,
            cart_lines_cleared = cleared,
            "Payment approved, order confirmed"
        );
        self.notify(&order);
        Ok(order)
    }

    /// Admin override: confirm an order as paid without a processor payment.
    ///
    /// Uses `payment_id` if given, or a synthetic `manual-<unix millis>` id.
    ///
    /// # Errors
    ///
    /// Same as [`Self::confirm_payment`].
    pub async fn mark_as_paid(
        &self,
        order_id: OrderId,
        payment_id: Option<String>,
    ) -> Result<Order, OrderError> {
        let payment_id = payment_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("manual-{}", self.clock.now().timestamp_millis()));
        tracing::warn!(order_id = %order_id, payment_id = %payment_id, "Manually marking order as paid");
        self.confirm_payment(order_id, &payment_id).await
    }

    /// Record a rejected payment. No stock or order status change.
    ///
    /// # Errors
    ///
    /// `InvalidPaymentTransition` if the payment is approved.
    pub async fn reject_payment(
        &self,
        order_id: OrderId,
        payment_id: &str,
    ) -> Result<Order, OrderError> {
        self.record_payment(order_id, PaymentStatus::Rejected, payment_id)
            .await
    }

    /// Record a payment still in progress. No stock or order status change.
    ///
    /// # Errors
    ///
    /// `InvalidPaymentTransition` if the payment is approved.
    pub async fn mark_payment_pending(
        &self,
        order_id: OrderId,
        payment_id: &str,
    ) -> Result<Order, OrderError> {
        self.record_payment(order_id, PaymentStatus::Pending, payment_id)
            .await
    }

    /// Record a cancelled, refunded or charged-back payment.
    /// No stock or order status change. A later attempt may still approve a
    /// `PENDING` order.
    ///
    /// # Errors
    ///
    /// `OrderNotFound` or storage errors.
    pub async fn mark_payment_cancelled(
        &self,
        order_id: OrderId,
        payment_id: &str,
    ) -> Result<Order, OrderError> {
        self.record_payment(order_id, PaymentStatus::Cancelled, payment_id)
            .await
    }

    #[instrument(skip(self), fields(order_id = %order_id, payment_status = %payment_status))]
    async fn record_payment(
        &self,
        order_id: OrderId,
        payment_status: PaymentStatus,
        payment_id: &str,
    ) -> Result<Order, OrderError> {
        let mut uow = self.store.begin().await?;
        let order = lock_order(uow.as_mut(), order_id).await?;

        require_payment_transition(&order, payment_status)?;

        let status = order.status;
        let order = self
            .apply_state(uow, order, status, payment_status, Some(payment_id))
            .await?;

        tracing::info!(order_id = %order.id, payment_id = %payment_id, "Payment status recorded");
        Ok(order)
    }

    // =========================================================================
    // Order status transitions
    // =========================================================================

    /// User-initiated cancellation of a pending order.
    ///
    /// Gives stock back only if the payment had been approved.
    ///
    /// # Errors
    ///
    /// - `OrderNotFound` if the order does not exist or belongs to someone else
    /// - `NotCancellable` if the order is not `PENDING`
    #[instrument(skip(self), fields(user_id = %user_id, order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<Order, OrderError> {
        let mut uow = self.store.begin().await?;
        let order = lock_order(uow.as_mut(), order_id).await?;

        if order.user_id != user_id {
            return Err(OrderError::OrderNotFound(order_id));
        }
        if order.status != OrderStatus::Pending {
            return Err(OrderError::NotCancellable {
                order_id,
                status: order.status,
            });
        }

        let order = self.cancel_locked(uow, order).await?;

        tracing::info!(order_id = %order.id, "Order cancelled by customer");
        self.notify(&order);
        Ok(order)
    }

    /// Admin status change along the transition table.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` for any change not in the table
    /// - `PaymentNotApproved` when confirming an order that is not paid
    #[instrument(skip(self), fields(order_id = %order_id, to = %new_status))]
    pub async fn update_status(
        &self,
        order_id: OrderId,
        new_status: OrderStatus,
    ) -> Result<Order, OrderError> {
        let mut uow = self.store.begin().await?;
        let order = lock_order(uow.as_mut(), order_id).await?;

        require_transition(&order, new_status)?;

        let order = match new_status {
            OrderStatus::Cancelled => self.cancel_locked(uow, order).await?,
            OrderStatus::Confirmed if order.payment_status != PaymentStatus::Approved => {
                return Err(OrderError::PaymentNotApproved(order_id));
            }
            _ => {
                let payment_status = order.payment_status;
                self.apply_state(uow, order, new_status, payment_status, None)
                    .await?
            }
        };

        tracing::info!(order_id = %order.id, status = %order.status, "Order status updated");
        self.notify(&order);
        Ok(order)
    }

    /// Cancel an order that is still unpaid past `cutoff`.
    ///
    /// Eligibility is re-checked under the lock. Returns `false` if the order
    /// was paid or changed since it was selected.
    ///
    /// # Errors
    ///
    /// `OrderNotFound` or storage errors.
    pub async fn expire_order(
        &self,
        order_id: OrderId,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, OrderError> {
        let mut uow = self.store.begin().await?;
        let order = lock_order(uow.as_mut(), order_id).await?;

        if !order.is_awaiting_payment() || order.created_at >= cutoff {
            return Ok(false);
        }

        // Unpaid: nothing was reserved, so no stock moves.
        self.apply_state(
            uow,
            order,
            OrderStatus::Cancelled,
            PaymentStatus::Cancelled,
            None,
        )
        .await?;

        tracing::info!(order_id = %order_id, "Expired unpaid order cancelled");
        Ok(true)
    }

    /// Cancel a locked order, restoring stock if it was paid.
    async fn cancel_locked(
        &self,
        mut uow: Box<dyn UnitOfWork>,
        order: Order,
    ) -> Result<Order, OrderError> {
        if order.holds_stock() {
            for item in &order.items {
                uow.increment_stock(item.product_id, item.quantity).await?;
            }
            tracing::info!(order_id = %order.id, "Stock restored for cancelled paid order");
        }

        self.apply_state(
            uow,
            order,
            OrderStatus::Cancelled,
            PaymentStatus::Cancelled,
            None,
        )
        .await
    }

    /// Write the new statuses, commit, and return the updated order.
    async fn apply_state(
        &self,
        mut uow: Box<dyn UnitOfWork>,
        mut order: Order,
        status: OrderStatus,
        payment_status: PaymentStatus,
        payment_id: Option<&str>,
    ) -> Result<Order, OrderError> {
        let update = OrderStateUpdate {
            status,
            payment_status,
            payment_id: payment_id.map(ToString::to_string),
            updated_at: self.clock.now(),
        };
        uow.update_order_state(order.id, &update).await?;
        uow.commit().await?;

        order.status = update.status;
        order.payment_status = update.payment_status;
        if let Some(payment_id) = update.payment_id {
            order.payment_id = Some(payment_id);
        }
        order.updated_at = update.updated_at;
        Ok(order)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// An order, visible only to its owner.
    ///
    /// # Errors
    ///
    /// `OrderNotFound` if the order does not exist or belongs to someone else.
    pub async fn find_user_order(
        &self,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<Order, OrderError> {
        match self.store.find_order(order_id).await? {
            Some(order) if order.user_id == user_id => Ok(order),
            _ => Err(OrderError::OrderNotFound(order_id)),
        }
    }

    /// A page of the user's orders, newest first.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn list_user_orders(
        &self,
        user_id: UserId,
        filter: OrderFilter,
    ) -> Result<OrderPage, OrderError> {
        let (orders, total) = self.store.list_user_orders(user_id, &filter).await?;
        Ok(OrderPage {
            orders,
            meta: PageMeta::new(total, &filter),
        })
    }

    /// Payment summary of one of the user's orders.
    ///
    /// # Errors
    ///
    /// `OrderNotFound` if the order does not exist or belongs to someone else.
    pub async fn payment_status(
        &self,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<PaymentSnapshot, OrderError> {
        let order = self.find_user_order(user_id, order_id).await?;
        Ok(PaymentSnapshot::from(&order))
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Tell the customer about `order` without waiting for delivery.
    fn notify(&self, order: &Order) {
        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        let order = order.clone();

        self.tasks.spawn(async move {
            let customer = match store.find_customer(order.user_id).await {
                Ok(Some(customer)) => customer,
                Ok(None) => {
                    tracing::warn!(order_id = %order.id, "No customer record; notification skipped");
                    return;
                }
                Err(e) => {
                    tracing::warn!(order_id = %order.id, error = %e, "Customer lookup failed; notification skipped");
                    return;
                }
            };

            let notice = OrderNotice::for_order(&order, &customer);
            if !notifier.send_order_update(&notice).await {
                tracing::warn!(order_id = %order.id, "Order notification was not delivered");
            }
        });
    }

    /// Wait until every notification spawned so far has finished.
    pub async fn flush_notifications(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

async fn lock_order(uow: &mut dyn UnitOfWork, order_id: OrderId) -> Result<Order, OrderError> {
    uow.lock_order(order_id)
        .await?
        .ok_or(OrderError::OrderNotFound(order_id))
}

fn require_transition(order: &Order, to: OrderStatus) -> Result<(), OrderError> {
    if order.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(OrderError::InvalidTransition {
            from: order.status,
            to,
        })
    }
}

fn require_payment_transition(order: &Order, to: PaymentStatus) -> Result<(), OrderError> {
    if order.payment_status.can_transition_to(to) {
        Ok(())
    } else {
        Err(OrderError::InvalidPaymentTransition {
            from: order.payment_status,
            to,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{Duration, TimeZone};
    use rust_decimal::Decimal;
    use tokio::sync::mpsc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::MemoryStore;
    use crate::models::{Customer, Product};

    struct ChannelNotifier(mpsc::UnboundedSender<OrderNotice>);

    #[async_trait::async_trait]
    impl Notifier for ChannelNotifier {
        async fn send_order_update(&self, notice: &OrderNotice) -> bool {
            self.0.send(notice.clone()).is_ok()
        }
    }

    struct Fixture {
        store: MemoryStore,
        engine: OrderEngine,
        clock: Arc<ManualClock>,
        notices: mpsc::UnboundedReceiver<OrderNotice>,
        user: UserId,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let (tx, notices) = mpsc::unbounded_channel();
        let engine = OrderEngine::new(
            Arc::new(store.clone()),
            Arc::new(ChannelNotifier(tx)),
            clock.clone(),
        );
        let user = UserId::new();
        store
            .insert_customer(Customer {
                id: user,
                name: "Ana".to_string(),
                email: "ana@example.com".to_string(),
            })
            .await;
        Fixture {
            store,
            engine,
            clock,
            notices,
            user,
        }
    }

    async fn product(store: &MemoryStore, stock: i32, price: i64) -> ProductId {
        let id = ProductId::new();
        store
            .insert_product(Product {
                id,
                name: format!("Product {stock}"),
                description: None,
                price: Price::new(Decimal::new(price, 0)).unwrap(),
                stock,
                active: true,
            })
            .await;
        id
    }

    async fn add_to_cart(store: &MemoryStore, user: UserId, product: ProductId, quantity: i32) {
        let mut uow = store.begin().await.unwrap();
        let cart = uow.lock_cart(user).await.unwrap();
        uow.upsert_cart_item(cart.id, product, quantity)
            .await
            .unwrap();
        uow.commit().await.unwrap();
    }

    async fn stock(store: &MemoryStore, id: ProductId) -> i32 {
        store.find_product(id).await.unwrap().unwrap().stock
    }

    async fn cart_len(store: &MemoryStore, user: UserId) -> usize {
        let mut uow = store.begin().await.unwrap();
        uow.lock_cart(user).await.unwrap().lines.len()
    }

    #[tokio::test]
    async fn test_checkout_snapshots_prices_without_touching_stock() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 2).await;

        let order = f
            .engine
            .create_from_cart(
                f.user,
                CheckoutMetadata {
                    shipping_address: Some(" Calle 123 ".to_string()),
                    notes: Some(String::new()),
                },
            )
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_status, PaymentStatus::Pending);
        assert_eq!(order.total.amount(), Decimal::new(200, 0));
        assert_eq!(order.shipping_address.as_deref(), Some("Calle 123"));
        assert_eq!(order.notes, None);
        assert_eq!(stock(&f.store, p).await, 5);
        assert_eq!(cart_len(&f.store, f.user).await, 1);
    }

    #[tokio::test]
    async fn test_second_checkout_conflicts() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 1).await;

        let first = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();
        let err = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap_err();

        assert!(matches!(err, OrderError::PendingOrderExists { blocking } if blocking == first.id));
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_empty_cart_is_invalid_state() {
        let f = fixture().await;
        let err = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::EmptyCart));
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_checkout_rejects_short_stock_all_or_nothing() {
        let f = fixture().await;
        let plenty = product(&f.store, 10, 50).await;
        let scarce = product(&f.store, 1, 80).await;
        add_to_cart(&f.store, f.user, plenty, 2).await;
        add_to_cart(&f.store, f.user, scarce, 3).await;

        let err = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap_err();

        match err {
            OrderError::InsufficientStock {
                product_id,
                available,
                requested,
                ..
            } => {
                assert_eq!(product_id, scarce);
                assert_eq!(available, 1);
                assert_eq!(requested, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        let (orders, total) = f
            .store
            .list_user_orders(f.user, &OrderFilter::default())
            .await
            .unwrap();
        assert!(orders.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_inactive_product_has_nothing_available() {
        let f = fixture().await;
        let id = ProductId::new();
        f.store
            .insert_product(Product {
                id,
                name: "Retired".to_string(),
                description: None,
                price: Price::new(Decimal::new(10, 0)).unwrap(),
                stock: 50,
                active: false,
            })
            .await;
        add_to_cart(&f.store, f.user, id, 1).await;

        let err = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::InsufficientStock { available: 0, .. }));
    }

    #[tokio::test]
    async fn test_confirm_decrements_once_and_clears_cart() {
        let mut f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 2).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();

        let confirmed = f.engine.confirm_payment(order.id, "pay-1").await.unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);
        assert_eq!(confirmed.payment_status, PaymentStatus::Approved);
        assert_eq!(confirmed.payment_id.as_deref(), Some("pay-1"));
        assert_eq!(stock(&f.store, p).await, 3);
        assert_eq!(cart_len(&f.store, f.user).await, 0);

        let err = f.engine.confirm_payment(order.id, "pay-1").await.unwrap_err();
        assert!(err.is_already_approved());
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(stock(&f.store, p).await, 3);

        let notice = f.notices.recv().await.unwrap();
        assert_eq!(notice.order_id, order.id);
        assert_eq!(notice.status, Some(OrderStatus::Confirmed));
        assert_eq!(notice.customer_email, "ana@example.com");
    }

    #[tokio::test]
    async fn test_confirm_rolls_back_when_stock_ran_out() {
        let f = fixture().await;
        let p = product(&f.store, 2, 100).await;
        add_to_cart(&f.store, f.user, p, 2).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();

        // Someone else bought the stock in the meantime.
        let mut uow = f.store.begin().await.unwrap();
        assert!(uow.decrement_stock(p, 1).await.unwrap());
        uow.commit().await.unwrap();

        let err = f.engine.confirm_payment(order.id, "pay-1").await.unwrap_err();
        assert!(matches!(err, OrderError::InsufficientStock { available: 1, .. }));

        let stored = f.store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        assert_eq!(stock(&f.store, p).await, 1);
        assert_eq!(cart_len(&f.store, f.user).await, 1);
    }

    #[tokio::test]
    async fn test_rejected_payment_can_be_retried() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 1).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();

        let rejected = f.engine.reject_payment(order.id, "pay-1").await.unwrap();
        assert_eq!(rejected.status, OrderStatus::Pending);
        assert_eq!(rejected.payment_status, PaymentStatus::Rejected);
        assert_eq!(stock(&f.store, p).await, 5);

        let confirmed = f.engine.confirm_payment(order.id, "pay-2").await.unwrap();
        assert_eq!(confirmed.payment_id.as_deref(), Some("pay-2"));
        assert_eq!(stock(&f.store, p).await, 4);

        // A stale "pending" after approval is refused.
        let err = f
            .engine
            .mark_payment_pending(order.id, "pay-2")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_cancelled_attempt_can_be_followed_by_approval() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 2).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();

        let cancelled = f
            .engine
            .mark_payment_cancelled(order.id, "pay-111")
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Pending);
        assert_eq!(cancelled.payment_status, PaymentStatus::Cancelled);

        let confirmed = f.engine.confirm_payment(order.id, "pay-222").await.unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);
        assert_eq!(confirmed.payment_status, PaymentStatus::Approved);
        assert_eq!(confirmed.payment_id.as_deref(), Some("pay-222"));
        assert_eq!(stock(&f.store, p).await, 3);
    }

    #[tokio::test]
    async fn test_manual_payment_after_cancelled_attempt() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 1).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();
        f.engine
            .mark_payment_cancelled(order.id, "pay-111")
            .await
            .unwrap();

        let paid = f.engine.mark_as_paid(order.id, None).await.unwrap();

        assert_eq!(paid.status, OrderStatus::Confirmed);
        assert_eq!(paid.payment_status, PaymentStatus::Approved);
        assert_eq!(stock(&f.store, p).await, 4);
    }

    #[tokio::test]
    async fn test_cancel_unpaid_leaves_stock() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 2).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();

        let cancelled = f.engine.cancel_order(f.user, order.id).await.unwrap();

        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.payment_status, PaymentStatus::Cancelled);
        assert_eq!(stock(&f.store, p).await, 5);

        // The user can check out again.
        assert!(
            f.engine
                .create_from_cart(f.user, CheckoutMetadata::default())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_cancel_requires_owner_and_pending() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 1).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();

        let err = f
            .engine
            .cancel_order(UserId::new(), order.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        f.engine.confirm_payment(order.id, "pay-1").await.unwrap();
        let err = f.engine.cancel_order(f.user, order.id).await.unwrap_err();
        assert!(matches!(err, OrderError::NotCancellable { .. }));
    }

    #[tokio::test]
    async fn test_admin_cancel_of_paid_order_restores_stock() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 2).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();
        f.engine.confirm_payment(order.id, "pay-1").await.unwrap();
        assert_eq!(stock(&f.store, p).await, 3);

        let cancelled = f
            .engine
            .update_status(order.id, OrderStatus::Cancelled)
            .await
            .unwrap();

        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(cancelled.payment_status, PaymentStatus::Cancelled);
        assert_eq!(stock(&f.store, p).await, 5);
    }

    #[tokio::test]
    async fn test_confirmation_requires_payment() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 1).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();

        let err = f
            .engine
            .update_status(order.id, OrderStatus::Confirmed)
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::PaymentNotApproved(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_fulfilment_path_and_terminal_state() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 1).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();
        f.engine.confirm_payment(order.id, "pay-1").await.unwrap();

        f.engine
            .update_status(order.id, OrderStatus::Shipped)
            .await
            .unwrap();
        let delivered = f
            .engine
            .update_status(order.id, OrderStatus::Delivered)
            .await
            .unwrap();
        assert_eq!(delivered.status, OrderStatus::Delivered);

        for target in OrderStatus::ALL {
            let err = f.engine.update_status(order.id, target).await.unwrap_err();
            assert!(matches!(err, OrderError::InvalidTransition { .. }));
        }
    }

    #[tokio::test]
    async fn test_mark_as_paid_uses_synthetic_id() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 1).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();

        let paid = f.engine.mark_as_paid(order.id, None).await.unwrap();

        let expected = format!("manual-{}", f.clock.now().timestamp_millis());
        assert_eq!(paid.payment_id.as_deref(), Some(expected.as_str()));

        let err = f
            .engine
            .mark_as_paid(order.id, Some("pay-9".to_string()))
            .await
            .unwrap_err();
        assert!(err.is_already_approved());
    }

    #[tokio::test]
    async fn test_expire_rechecks_eligibility() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 1).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();

        let before_creation = order.created_at;
        assert!(!f.engine.expire_order(order.id, before_creation).await.unwrap());

        f.clock.advance(Duration::hours(25));
        let cutoff = f.clock.now() - Duration::hours(24);
        assert!(f.engine.expire_order(order.id, cutoff).await.unwrap());

        let stored = f.store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert_eq!(stored.payment_status, PaymentStatus::Cancelled);
        assert!(!f.engine.expire_order(order.id, cutoff).await.unwrap());
    }

    #[tokio::test]
    async fn test_queries_are_owner_scoped() {
        let f = fixture().await;
        let p = product(&f.store, 5, 100).await;
        add_to_cart(&f.store, f.user, p, 1).await;
        let order = f
            .engine
            .create_from_cart(f.user, CheckoutMetadata::default())
            .await
            .unwrap();

        assert_eq!(
            f.engine.find_user_order(f.user, order.id).await.unwrap().id,
            order.id
        );
        assert!(f.engine.find_user_order(UserId::new(), order.id).await.is_err());

        let snapshot = f.engine.payment_status(f.user, order.id).await.unwrap();
        assert_eq!(snapshot.payment_status, PaymentStatus::Pending);

        let page = f
            .engine
            .list_user_orders(
                f.user,
                OrderFilter {
                    status: Some(OrderStatus::Pending),
                    ..OrderFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.meta.total, 1);
        assert_eq!(page.meta.total_pages, 1);
        assert_eq!(page.orders.len(), 1);

        let page = f
            .engine
            .list_user_orders(
                f.user,
                OrderFilter {
                    status: Some(OrderStatus::Shipped),
                    ..OrderFilter::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.meta.total, 0);
    }
}
