//! Payment processor integration.
//!
//! - [`PaymentGateway`] - the seam between the order flow and the processor
//! - [`MercadoPagoClient`] - HTTP implementation against the `MercadoPago` API
//! - [`PaymentService`] - checkout preference creation and reuse
//! - [`WebhookReconciler`] - applies processor notifications to orders
//!
//! # API Reference
//!
//! - Base URL: `https://api.mercadopago.com`
//! - Authentication: `Authorization: Bearer <access token>`
//! - Preferences: `POST /checkout/preferences`, `GET /checkout/preferences/{id}`
//! - Payments: `GET /v1/payments/{id}`

mod checkout;
mod error;
mod mercadopago;
mod types;
mod webhook;

pub use checkout::{CheckoutError, CheckoutSettings, PaymentService, PreferenceLink};
pub use error::PaymentError;
pub use mercadopago::MercadoPagoClient;
pub use types::*;
pub use webhook::{
    SignatureHeader, SignatureVerifier, WebhookError, WebhookNotification, WebhookOutcome,
    WebhookQuery, WebhookReconciler, manifest,
};

use async_trait::async_trait;

/// Outbound calls to the payment processor.
///
/// Nothing is cached: every call reaches the processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a checkout preference.
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<Preference, PaymentError>;

    /// Fetch a previously created preference.
    async fn get_preference(&self, preference_id: &str) -> Result<Preference, PaymentError>;

    /// Fetch the authoritative record of a payment.
    async fn fetch_payment(&self, payment_id: &str) -> Result<PaymentRecord, PaymentError>;
}
