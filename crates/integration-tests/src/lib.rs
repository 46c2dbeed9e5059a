//! Integration tests for Kiosk.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p kiosk-integration-tests
//! ```
//!
//! No database or processor account is needed: scenarios run against the
//! in-memory store, a scripted payment gateway and a manual clock. The HTTP
//! client tests serve a mock processor with axum on an ephemeral port.
//!
//! # Test Categories
//!
//! - `checkout_flow` - Cart to paid order, through the webhook endpoint
//! - `concurrency` - Stock and duplicate-delivery races
//! - `expiration` - The expiration sweeper
//! - `state_machine` - Admin status transitions
//! - `mercadopago_client` - The HTTP gateway client

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use secrecy::SecretString;
use sha2::Sha256;

use kiosk_core::{OrderId, OrderStatus, PaymentStatus, Price, ProductId, UserId};
use kiosk_server::clock::{Clock, ManualClock};
use kiosk_server::config::SweeperConfig;
use kiosk_server::db::{MemoryStore, Store};
use kiosk_server::models::{CheckoutMetadata, Customer, Order, OrderStateUpdate, Product};
use kiosk_server::payments::{
    CheckoutSettings, PaymentError, PaymentGateway, PaymentRecord, PaymentService, Preference,
    PreferenceRequest, ProcessorStatus, SignatureVerifier, WebhookReconciler, manifest,
};
use kiosk_server::services::{CartService, Notifier, OrderEngine, OrderNotice};
use kiosk_server::state::AppState;
use kiosk_server::sweeper::ExpirationSweeper;

/// Shared secret the harness signs notifications with.
pub const WEBHOOK_SECRET: &str = "whsec-integration-secret";

/// Start of every scenario.
#[must_use]
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

/// `x-signature` header for a notification about `data_id`.
#[must_use]
pub fn sign(data_id: &str, request_id: &str, ts: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(manifest(data_id, request_id, ts).as_bytes());
    format!("ts={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
}

// =============================================================================
// Notifier
// =============================================================================

/// Keeps every notice it is asked to send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<OrderNotice>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn notices(&self) -> Vec<OrderNotice> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_order_update(&self, notice: &OrderNotice) -> bool {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notice.clone());
        true
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// A payment processor that answers from a script.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    payments: Mutex<HashMap<String, PaymentRecord>>,
    preferences: Mutex<Vec<PreferenceRequest>>,
}

impl ScriptedGateway {
    /// Make `payment_id` known with `status`, referencing `order_id`.
    pub fn set_payment(&self, payment_id: &str, status: &str, order_id: Option<OrderId>) {
        self.payments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                payment_id.to_string(),
                PaymentRecord {
                    id: payment_id.to_string(),
                    status: ProcessorStatus::from(status),
                    status_detail: None,
                    external_reference: order_id.map(|id| id.to_string()),
                },
            );
    }

    /// Preference requests received so far.
    #[must_use]
    pub fn preference_requests(&self) -> Vec<PreferenceRequest> {
        self.preferences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<Preference, PaymentError> {
        let mut preferences = self.preferences.lock().unwrap_or_else(PoisonError::into_inner);
        preferences.push(request.clone());
        let id = format!("pref-{}", preferences.len());
        Ok(Preference {
            init_point: format!("https://pay.example/checkout?pref_id={id}"),
            sandbox_init_point: None,
            external_reference: Some(request.external_reference.clone()),
            id,
        })
    }

    async fn get_preference(&self, preference_id: &str) -> Result<Preference, PaymentError> {
        Err(PaymentError::NotFound(preference_id.to_string()))
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<PaymentRecord, PaymentError> {
        self.payments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(payment_id)
            .cloned()
            .ok_or_else(|| PaymentError::NotFound(payment_id.to_string()))
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Every service wired against the in-memory store.
pub struct Harness {
    pub store: MemoryStore,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub gateway: Arc<ScriptedGateway>,
    pub engine: OrderEngine,
    pub carts: CartService,
    pub payments: PaymentService,
    pub reconciler: WebhookReconciler,
    pub sweeper: ExpirationSweeper,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    #[must_use]
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let notifier = Arc::new(RecordingNotifier::default());
        let gateway = Arc::new(ScriptedGateway::default());

        let engine = OrderEngine::new(Arc::new(store.clone()), notifier.clone(), clock.clone());
        let carts = CartService::new(Arc::new(store.clone()));
        let payments = PaymentService::new(
            Arc::new(store.clone()),
            gateway.clone(),
            clock.clone(),
            CheckoutSettings {
                frontend_url: "https://shop.example".to_string(),
                notification_url: "https://api.shop.example/api/payments/webhook".to_string(),
                currency: "ARS".to_string(),
                statement_descriptor: "KIOSK".to_string(),
            },
        );
        let reconciler = WebhookReconciler::new(
            engine.clone(),
            gateway.clone(),
            SignatureVerifier::new(Some(SecretString::from(WEBHOOK_SECRET))),
        );
        let sweeper = ExpirationSweeper::new(engine.clone(), SweeperConfig::default());

        Self {
            store,
            clock,
            notifier,
            gateway,
            engine,
            carts,
            payments,
            reconciler,
            sweeper,
        }
    }

    /// Add an active product.
    pub async fn add_product(&self, name: &str, stock: i32, price: i64) -> ProductId {
        let id = ProductId::new();
        self.store
            .insert_product(Product {
                id,
                name: name.to_string(),
                description: Some(format!("{name} from the integration catalog")),
                price: Price::new(Decimal::new(price, 0)).expect("non-negative price"),
                stock,
                active: true,
            })
            .await;
        id
    }

    /// Add a customer.
    pub async fn add_customer(&self, name: &str) -> UserId {
        let id = UserId::new();
        self.store
            .insert_customer(Customer {
                id,
                name: name.to_string(),
                email: format!("{}@example.com", name.to_lowercase()),
            })
            .await;
        id
    }

    /// Put `quantity` of `product` in the user's cart and check out.
    pub async fn place_order(&self, user: UserId, product: ProductId, quantity: i32) -> Order {
        self.carts
            .add_item(user, product, quantity)
            .await
            .expect("add to cart");
        self.engine
            .create_from_cart(user, CheckoutMetadata::default())
            .await
            .expect("checkout")
    }

    /// An order left `PENDING` with an `APPROVED` payment and its stock
    /// taken, written straight to the store.
    pub async fn place_paid_pending_order(
        &self,
        user: UserId,
        product: ProductId,
        quantity: i32,
    ) -> Order {
        let order = self.place_order(user, product, quantity).await;

        let mut uow = self.store.begin().await.expect("begin");
        for item in &order.items {
            assert!(
                uow.decrement_stock(item.product_id, item.quantity)
                    .await
                    .expect("decrement"),
                "stock for {}",
                item.product_name
            );
        }
        uow.update_order_state(
            order.id,
            &OrderStateUpdate {
                status: OrderStatus::Pending,
                payment_status: PaymentStatus::Approved,
                payment_id: Some("seeded-1".to_string()),
                updated_at: self.clock.now(),
            },
        )
        .await
        .expect("update order");
        uow.commit().await.expect("commit");

        self.order(order.id).await
    }

    pub async fn stock(&self, product: ProductId) -> i32 {
        self.store
            .find_product(product)
            .await
            .expect("store")
            .expect("product exists")
            .stock
    }

    pub async fn order(&self, order_id: OrderId) -> Order {
        self.store
            .find_order(order_id)
            .await
            .expect("store")
            .expect("order exists")
    }

    /// Application state for the HTTP surface.
    #[must_use]
    pub fn app_state(&self) -> AppState {
        AppState::new(Arc::new(self.store.clone()), self.reconciler.clone())
    }
}

/// Serve `router` on an ephemeral local port.
pub async fn serve(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local address");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server");
    });
    addr
}
