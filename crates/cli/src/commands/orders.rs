//! Admin overrides on orders.
//!
//! Every override goes through the same order engine as the live service, so
//! the state machine and stock rules apply unchanged.
//!
//! # Usage
//!
//! ```bash
//! kiosk orders sync-payment -o 0b9c...-... -p 1234567890
//! kiosk orders mark-paid -o 0b9c...-...
//! kiosk orders set-status -o 0b9c...-... -s shipped
//! kiosk orders sweep
//! ```
//!
//! # Environment Variables
//!
//! Same as the server (`KIOSK_DATABASE_URL`, `MERCADOPAGO_ACCESS_TOKEN`, ...).

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use kiosk_core::{OrderId, OrderStatus, PaymentStatus};
use kiosk_server::clock::{Clock, SystemClock};
use kiosk_server::config::{ConfigError, ServerConfig};
use kiosk_server::db::{self, PgStore, Store};
use kiosk_server::models::Order;
use kiosk_server::payments::{
    MercadoPagoClient, PaymentError, SignatureVerifier, WebhookError, WebhookReconciler,
};
use kiosk_server::services::{OrderEngine, OrderError, notifier};
use kiosk_server::sweeper::ExpirationSweeper;

#[derive(Debug, Error)]
pub enum OrdersError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database connection error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),
}

/// Services wired against the production database and processor.
pub struct Context {
    config: ServerConfig,
    engine: OrderEngine,
    reconciler: WebhookReconciler,
}

impl Context {
    /// Connect using the server's environment configuration.
    pub async fn from_env() -> Result<Self, OrdersError> {
        let config = ServerConfig::from_env()?;

        tracing::info!("Connecting to database...");
        let pool = db::create_pool(&config.database_url).await?;

        let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let engine = OrderEngine::new(store, notifier::from_config(&config), clock);
        let gateway = MercadoPagoClient::new(&config.payments)?;
        let reconciler = WebhookReconciler::new(
            engine.clone(),
            Arc::new(gateway),
            // Operator commands are not signed notifications.
            SignatureVerifier::new(None),
        );

        Ok(Self {
            config,
            engine,
            reconciler,
        })
    }

    /// Fetch `payment_id` from the processor and apply it to `order_id`.
    pub async fn sync_payment(&self, order_id: OrderId, payment_id: &str) -> Result<(), OrdersError> {
        let outcome = self.reconciler.sync_payment(order_id, payment_id).await?;
        self.engine.flush_notifications().await;
        print_json(&outcome)
    }

    /// Confirm an order as paid without a processor payment.
    pub async fn mark_paid(
        &self,
        order_id: OrderId,
        payment_id: Option<String>,
    ) -> Result<(), OrdersError> {
        let order = self.engine.mark_as_paid(order_id, payment_id).await?;
        self.engine.flush_notifications().await;
        print_json(&OrderSummary::from(&order))
    }

    /// Move an order along its status machine.
    pub async fn set_status(&self, order_id: OrderId, status: OrderStatus) -> Result<(), OrdersError> {
        let order = self.engine.update_status(order_id, status).await?;
        self.engine.flush_notifications().await;
        print_json(&OrderSummary::from(&order))
    }

    /// Run one expiration sweep.
    pub async fn sweep(&self) -> Result<(), OrdersError> {
        let sweeper = ExpirationSweeper::new(self.engine.clone(), self.config.sweeper);
        let report = sweeper.sweep().await?;
        print_json(&report)
    }
}

#[derive(Debug, Serialize)]
struct OrderSummary<'a> {
    id: OrderId,
    status: OrderStatus,
    payment_status: PaymentStatus,
    payment_id: Option<&'a str>,
    total: String,
}

impl<'a> From<&'a Order> for OrderSummary<'a> {
    fn from(order: &'a Order) -> Self {
        Self {
            id: order.id,
            status: order.status,
            payment_status: order.payment_status,
            payment_id: order.payment_id.as_deref(),
            total: order.total.display(),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), OrdersError> {
    let output = serde_json::to_string_pretty(value)?;
    #[allow(clippy::print_stdout)]
    {
        println!("{output}");
    }
    Ok(())
}
