//! Payment notification reconciliation.
//!
//! The processor notifies us about payments asynchronously, possibly more
//! than once and out of order. A notification is only a hint: after its
//! signature checks out, the payment is fetched from the processor and the
//! fetched status is what gets applied to the order. The order engine's
//! state guards make re-delivery harmless.
//!
//! # Signature
//!
//! The `x-signature` header carries `ts=<timestamp>,v1=<hex digest>`. The
//! digest is `HMAC-SHA256(secret, "id:<data id>;request-id:<x-request-id>;ts:<ts>;")`.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::instrument;

use kiosk_core::OrderId;

use super::{PaymentAction, PaymentError, PaymentGateway, PaymentRecord};
use crate::error::ErrorKind;
use crate::services::{OrderEngine, OrderError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum WebhookError {
    /// Missing, malformed or mismatching signature.
    #[error("webhook rejected: {0}")]
    Unauthorized(String),

    #[error("payment {payment_id} references order {reference}, not {order_id}")]
    ReferenceMismatch {
        payment_id: String,
        order_id: OrderId,
        reference: String,
    },

    #[error(transparent)]
    Gateway(#[from] PaymentError),

    #[error(transparent)]
    Order(#[from] OrderError),
}

impl WebhookError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::ReferenceMismatch { .. } => ErrorKind::InvalidState,
            Self::Gateway(err) => err.kind(),
            Self::Order(err) => err.kind(),
        }
    }
}

// =============================================================================
// Notification parsing
// =============================================================================

/// Query parameters the processor appends to the notification URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WebhookQuery {
    #[serde(rename = "data.id")]
    pub data_id: Option<String>,
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub topic: Option<String>,
}

/// One inbound notification, as received.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookNotification {
    pub query: WebhookQuery,
    /// Parsed body; `Null` when the body is empty or not JSON.
    pub body: Value,
    /// Raw `x-signature` header.
    pub signature: Option<String>,
    /// Raw `x-request-id` header.
    pub request_id: Option<String>,
}

impl WebhookNotification {
    #[must_use]
    pub fn new(
        query: WebhookQuery,
        body: &[u8],
        signature: Option<String>,
        request_id: Option<String>,
    ) -> Self {
        Self {
            query,
            body: serde_json::from_slice(body).unwrap_or(Value::Null),
            signature,
            request_id,
        }
    }

    /// Whether this notification is about a payment.
    #[must_use]
    pub fn is_payment(&self) -> bool {
        let is_payment = |value: Option<&str>| value.is_some_and(|v| v.eq_ignore_ascii_case("payment"));

        is_payment(self.body.get("type").and_then(Value::as_str))
            || is_payment(self.body.get("topic").and_then(Value::as_str))
            || is_payment(self.query.kind.as_deref())
            || is_payment(self.query.topic.as_deref())
            || self
                .body
                .get("action")
                .and_then(Value::as_str)
                .is_some_and(|action| action.starts_with("payment."))
    }

    /// The payment id. This one id is both verified and processed.
    ///
    /// The query's `data.id` (or `id`) wins; the payload is only read when
    /// the query has none. In the payload: `data.id`, then `resource`
    /// (`.../payments/<id>` or a bare id), then `id`.
    #[must_use]
    pub fn payment_id(&self) -> Option<String> {
        non_blank(self.query.data_id.as_deref())
            .or_else(|| non_blank(self.query.id.as_deref()))
            .or_else(|| {
                self.body
                    .get("data")
                    .and_then(|data| data.get("id"))
                    .and_then(id_value)
            })
            .or_else(|| {
                self.body
                    .get("resource")
                    .and_then(Value::as_str)
                    .and_then(resource_id)
            })
            .or_else(|| self.body.get("id").and_then(id_value))
    }
}

fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_blank(Some(s)),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn resource_id(resource: &str) -> Option<String> {
    let last = resource.trim().trim_end_matches('/').rsplit('/').next()?;
    (!last.is_empty() && last.chars().all(|c| c.is_ascii_digit())).then(|| last.to_string())
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

// =============================================================================
// Signature verification
// =============================================================================

/// Parsed `x-signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub ts: String,
    pub v1: String,
}

impl SignatureHeader {
    /// Parse `ts=...,v1=...`, in any order, ignoring whitespace and unknown parts.
    #[must_use]
    pub fn parse(header: &str) -> Option<Self> {
        let mut ts = None;
        let mut v1 = None;
        for part in header.split(',') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "ts" => ts = non_blank(Some(value)),
                "v1" => v1 = non_blank(Some(value)),
                _ => {}
            }
        }
        Some(Self { ts: ts?, v1: v1? })
    }
}

/// The signed string.
#[must_use]
pub fn manifest(data_id: &str, request_id: &str, ts: &str) -> String {
    format!("id:{data_id};request-id:{request_id};ts:{ts};")
}

/// Verifies notification signatures against the shared secret.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Option<SecretString>,
}

impl SignatureVerifier {
    /// `None` disables verification; every skipped check is logged.
    #[must_use]
    pub const fn new(secret: Option<SecretString>) -> Self {
        Self { secret }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Check a notification signature.
    ///
    /// # Errors
    ///
    /// `Unauthorized` if a secret is configured and the headers are missing,
    /// malformed, or do not match.
    pub fn verify(
        &self,
        data_id: &str,
        request_id: Option<&str>,
        signature: Option<&str>,
    ) -> Result<(), WebhookError> {
        let Some(secret) = &self.secret else {
            tracing::warn!(data_id = %data_id, "Webhook secret not configured; skipping signature verification");
            return Ok(());
        };

        let header = signature
            .ok_or_else(|| WebhookError::Unauthorized("missing x-signature header".to_string()))?;
        let header = SignatureHeader::parse(header)
            .ok_or_else(|| WebhookError::Unauthorized("malformed x-signature header".to_string()))?;
        let request_id = request_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| WebhookError::Unauthorized("missing x-request-id header".to_string()))?;

        let expected = hex::decode(&header.v1)
            .map_err(|_| WebhookError::Unauthorized("signature is not hex".to_string()))?;

        let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|_| WebhookError::Unauthorized("invalid webhook secret".to_string()))?;
        mac.update(manifest(data_id, request_id, &header.ts).as_bytes());

        // Constant-time comparison
        mac.verify_slice(&expected)
            .map_err(|_| WebhookError::Unauthorized("signature mismatch".to_string()))
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// What a notification (or a manual sync) led to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Not something we act on.
    Ignored { reason: String },
    /// The processor does not know the payment (typical of test notifications).
    PaymentNotFound { payment_id: String },
    /// The payment references no order of ours.
    OrderNotFound { payment_id: String, reference: String },
    Applied {
        order_id: OrderId,
        payment_id: String,
        action: PaymentAction,
    },
    /// The order's state already rules the change out (duplicate or late delivery).
    Skipped {
        order_id: OrderId,
        payment_id: String,
        reason: String,
    },
    /// A processor status this service does not model.
    Unhandled {
        order_id: OrderId,
        payment_id: String,
        status: String,
    },
}

impl WebhookOutcome {
    fn ignored(reason: &str) -> Self {
        Self::Ignored {
            reason: reason.to_string(),
        }
    }
}

/// Applies processor payment state to orders.
#[derive(Clone)]
pub struct WebhookReconciler {
    engine: OrderEngine,
    gateway: Arc<dyn PaymentGateway>,
    verifier: SignatureVerifier,
}

impl WebhookReconciler {
    #[must_use]
    pub fn new(
        engine: OrderEngine,
        gateway: Arc<dyn PaymentGateway>,
        verifier: SignatureVerifier,
    ) -> Self {
        Self {
            engine,
            gateway,
            verifier,
        }
    }

    /// Handle one inbound notification.
    ///
    /// Anything that a retry could not fix is acknowledged with an outcome
    /// instead of an error.
    ///
    /// # Errors
    ///
    /// - `Unauthorized` for signature failures; nothing is fetched or changed
    /// - `Gateway` if the payment cannot be fetched
    /// - `Order` for storage failures or stock shortfalls at approval
    #[instrument(skip_all)]
    pub async fn handle(
        &self,
        notification: &WebhookNotification,
    ) -> Result<WebhookOutcome, WebhookError> {
        if !notification.is_payment() {
            tracing::debug!("Ignoring non-payment notification");
            return Ok(WebhookOutcome::ignored("not a payment notification"));
        }
        let Some(payment_id) = notification.payment_id() else {
            tracing::info!("Payment notification without a payment id");
            return Ok(WebhookOutcome::ignored("no payment id"));
        };

        if let Err(e) = self.verifier.verify(
            &payment_id.to_lowercase(),
            notification.request_id.as_deref(),
            notification.signature.as_deref(),
        ) {
            tracing::warn!(
                event = "webhook_signature_rejected",
                payment_id = %payment_id,
                request_id = ?notification.request_id,
                error = %e,
                "Rejected payment notification"
            );
            return Err(e);
        }

        let payment = match self.gateway.fetch_payment(&payment_id).await {
            Ok(payment) => payment,
            Err(PaymentError::NotFound(_)) => {
                tracing::info!(payment_id = %payment_id, "Payment not found at processor; acknowledging");
                return Ok(WebhookOutcome::PaymentNotFound { payment_id });
            }
            Err(e) => return Err(e.into()),
        };

        let Some(reference) = non_blank(payment.external_reference.as_deref()) else {
            tracing::info!(payment_id = %payment_id, "Payment has no external reference");
            return Ok(WebhookOutcome::ignored("payment has no external reference"));
        };
        let not_found = || WebhookOutcome::OrderNotFound {
            payment_id: payment.id.clone(),
            reference: reference.clone(),
        };
        let Ok(order_id) = reference.parse::<OrderId>() else {
            tracing::info!(payment_id = %payment_id, reference = %reference, "External reference is not an order id");
            return Ok(not_found());
        };

        match self.apply(order_id, &payment).await {
            Err(WebhookError::Order(OrderError::OrderNotFound(_))) => {
                tracing::info!(payment_id = %payment_id, order_id = %order_id, "Referenced order does not exist");
                Ok(not_found())
            }
            other => other,
        }
    }

    /// Re-apply a payment to an order on operator request.
    ///
    /// # Errors
    ///
    /// - `ReferenceMismatch` if the payment belongs to another order
    /// - `Gateway` if the payment cannot be fetched (including unknown ids)
    /// - `Order` as for [`Self::handle`], plus `OrderNotFound`
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn sync_payment(
        &self,
        order_id: OrderId,
        payment_id: &str,
    ) -> Result<WebhookOutcome, WebhookError> {
        let payment = self.gateway.fetch_payment(payment_id).await?;

        let mismatch = non_blank(payment.external_reference.as_deref())
            .filter(|reference| *reference != order_id.to_string());
        if let Some(reference) = mismatch {
            return Err(WebhookError::ReferenceMismatch {
                payment_id: payment.id,
                order_id,
                reference,
            });
        }

        self.apply(order_id, &payment).await
    }

    /// Map the payment status onto the order engine.
    async fn apply(
        &self,
        order_id: OrderId,
        payment: &PaymentRecord,
    ) -> Result<WebhookOutcome, WebhookError> {
        let action = payment.status.action();
        let result = match action {
            PaymentAction::Confirm => self.engine.confirm_payment(order_id, &payment.id).await,
            PaymentAction::Reject => self.engine.reject_payment(order_id, &payment.id).await,
            PaymentAction::MarkPending => {
                self.engine.mark_payment_pending(order_id, &payment.id).await
            }
            PaymentAction::MarkCancelled => {
                self.engine
                    .mark_payment_cancelled(order_id, &payment.id)
                    .await
            }
            PaymentAction::Ignore => {
                tracing::info!(
                    order_id = %order_id,
                    payment_id = %payment.id,
                    status = %payment.status,
                    "Unrecognized payment status; no change"
                );
                return Ok(WebhookOutcome::Unhandled {
                    order_id,
                    payment_id: payment.id.clone(),
                    status: payment.status.to_string(),
                });
            }
        };

        match result {
            Ok(_) => Ok(WebhookOutcome::Applied {
                order_id,
                payment_id: payment.id.clone(),
                action,
            }),
            Err(e) if e.kind() == ErrorKind::InvalidState => {
                if action == PaymentAction::Confirm && !e.is_already_approved() {
                    // Money was taken for an order that can no longer be fulfilled.
                    tracing::warn!(
                        event = "payment_after_close",
                        order_id = %order_id,
                        payment_id = %payment.id,
                        error = %e,
                        "Approved payment for a closed order; needs manual refund"
                    );
                } else {
                    tracing::info!(
                        order_id = %order_id,
                        payment_id = %payment.id,
                        reason = %e,
                        "Duplicate or out-of-order payment notification"
                    );
                }
                Ok(WebhookOutcome::Skipped {
                    order_id,
                    payment_id: payment.id.clone(),
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    use kiosk_core::{OrderStatus, PaymentStatus, Price, ProductId, UserId};

    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{MemoryStore, Store, UnitOfWork};
    use crate::models::{CheckoutMetadata, Product};
    use crate::payments::{Preference, PreferenceRequest, ProcessorStatus};
    use crate::services::{CartService, EmailBranding, LogNotifier};

    const SECRET: &str = "whsec-test-secret";

    fn sign(data_id: &str, request_id: &str, ts: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(manifest(data_id, request_id, ts).as_bytes());
        format!("ts={ts},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[derive(Default)]
    struct ScriptedGateway {
        payments: Mutex<HashMap<String, PaymentRecord>>,
        fetches: Mutex<u32>,
    }

    impl ScriptedGateway {
        fn put(&self, id: &str, status: &str, reference: Option<String>) {
            self.payments.lock().unwrap().insert(
                id.to_string(),
                PaymentRecord {
                    id: id.to_string(),
                    status: ProcessorStatus::from(status),
                    status_detail: None,
                    external_reference: reference,
                },
            );
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn create_preference(
            &self,
            _request: &PreferenceRequest,
        ) -> Result<Preference, PaymentError> {
            Err(PaymentError::Timeout)
        }

        async fn get_preference(&self, preference_id: &str) -> Result<Preference, PaymentError> {
            Err(PaymentError::NotFound(preference_id.to_string()))
        }

        async fn fetch_payment(&self, payment_id: &str) -> Result<PaymentRecord, PaymentError> {
            *self.fetches.lock().unwrap() += 1;
            self.payments
                .lock()
                .unwrap()
                .get(payment_id)
                .cloned()
                .ok_or_else(|| PaymentError::NotFound(payment_id.to_string()))
        }
    }

    struct Fixture {
        store: MemoryStore,
        engine: OrderEngine,
        gateway: Arc<ScriptedGateway>,
        reconciler: WebhookReconciler,
        product: ProductId,
        order_id: OrderId,
    }

    async fn fixture(secret: Option<&str>) -> Fixture {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let notifier = Arc::new(LogNotifier::new(EmailBranding {
            app_name: "Kiosk".to_string(),
            frontend_url: "https://shop.example".to_string(),
            currency: "ARS".to_string(),
        }));
        let engine = OrderEngine::new(Arc::new(store.clone()), notifier, clock);
        let gateway = Arc::new(ScriptedGateway::default());
        let reconciler = WebhookReconciler::new(
            engine.clone(),
            gateway.clone(),
            SignatureVerifier::new(secret.map(SecretString::from)),
        );

        let product = ProductId::new();
        store
            .insert_product(Product {
                id: product,
                name: "Bombilla".to_string(),
                description: None,
                price: Price::new(Decimal::new(100, 0)).unwrap(),
                stock: 5,
                active: true,
            })
            .await;
        let user = UserId::new();
        CartService::new(Arc::new(store.clone()))
            .add_item(user, product, 2)
            .await
            .unwrap();
        let order = engine
            .create_from_cart(user, CheckoutMetadata::default())
            .await
            .unwrap();

        Fixture {
            store,
            engine,
            gateway,
            reconciler,
            product,
            order_id: order.id,
        }
    }

    fn payment_notification(payment_id: &str, signature: Option<String>) -> WebhookNotification {
        let body = json!({
            "action": "payment.updated",
            "type": "payment",
            "data": { "id": payment_id },
        });
        WebhookNotification::new(
            WebhookQuery {
                data_id: Some(payment_id.to_string()),
                kind: Some("payment".to_string()),
                ..WebhookQuery::default()
            },
            body.to_string().as_bytes(),
            signature,
            Some("req-1".to_string()),
        )
    }

    async fn stock(store: &MemoryStore, id: ProductId) -> i32 {
        store.find_product(id).await.unwrap().unwrap().stock
    }

    #[test]
    fn test_signature_header_parsing() {
        assert_eq!(
            SignatureHeader::parse("ts=1704908010, v1=abc123"),
            Some(SignatureHeader {
                ts: "1704908010".to_string(),
                v1: "abc123".to_string()
            })
        );
        assert_eq!(
            SignatureHeader::parse("v1=abc,ts=42,extra=1").map(|h| h.ts),
            Some("42".to_string())
        );
        assert_eq!(SignatureHeader::parse("ts=42"), None);
        assert_eq!(SignatureHeader::parse("garbage"), None);
    }

    #[test]
    fn test_verifier() {
        let verifier = SignatureVerifier::new(Some(SecretString::from(SECRET)));
        let header = sign("123", "req-1", "1700000000");

        assert!(verifier.verify("123", Some("req-1"), Some(&header)).is_ok());
        assert!(verifier.verify("124", Some("req-1"), Some(&header)).is_err());
        assert!(verifier.verify("123", Some("req-2"), Some(&header)).is_err());
        assert!(verifier.verify("123", None, Some(&header)).is_err());
        assert!(verifier.verify("123", Some("req-1"), None).is_err());
        assert!(
            verifier
                .verify("123", Some("req-1"), Some("ts=1700000000,v1=not-hex"))
                .is_err()
        );

        let disabled = SignatureVerifier::new(None);
        assert!(disabled.verify("123", None, None).is_ok());
    }

    #[test]
    fn test_payment_id_shapes() {
        let parse = |body: Value| {
            WebhookNotification::new(WebhookQuery::default(), body.to_string().as_bytes(), None, None)
        };

        assert_eq!(
            parse(json!({"type": "payment", "data": {"id": 123}})).payment_id(),
            Some("123".to_string())
        );
        let resource = parse(json!({"topic": "payment", "resource": "https://api.mercadopago.com/v1/payments/987"}));
        assert!(resource.is_payment());
        assert_eq!(resource.payment_id(), Some("987".to_string()));
        assert_eq!(
            parse(json!({"topic": "payment", "resource": "555"})).payment_id(),
            Some("555".to_string())
        );
        assert_eq!(
            parse(json!({"type": "payment", "id": "42"})).payment_id(),
            Some("42".to_string())
        );
        assert!(parse(json!({"action": "payment.created"})).is_payment());
        assert!(!parse(json!({"topic": "merchant_order", "id": 1})).is_payment());

        let query_only = WebhookNotification::new(
            WebhookQuery {
                id: Some("77".to_string()),
                topic: Some("payment".to_string()),
                ..WebhookQuery::default()
            },
            b"not json",
            None,
            None,
        );
        assert!(query_only.is_payment());
        assert_eq!(query_only.body, Value::Null);
        assert_eq!(query_only.payment_id(), Some("77".to_string()));
    }

    #[test]
    fn test_query_id_wins_over_payload() {
        let notification = WebhookNotification::new(
            WebhookQuery {
                data_id: Some("123".to_string()),
                id: Some("456".to_string()),
                ..WebhookQuery::default()
            },
            br#"{"type": "payment", "data": {"id": "999"}}"#,
            None,
            None,
        );
        assert_eq!(notification.payment_id(), Some("123".to_string()));

        let bare = WebhookNotification::new(
            WebhookQuery {
                data_id: Some("  ".to_string()),
                id: Some("456".to_string()),
                ..WebhookQuery::default()
            },
            br#"{"data": {"id": "999"}}"#,
            None,
            None,
        );
        assert_eq!(bare.payment_id(), Some("456".to_string()));
    }

    #[tokio::test]
    async fn test_payload_id_cannot_redirect_a_signed_delivery() {
        let f = fixture(Some(SECRET)).await;
        let other = UserId::new();
        CartService::new(Arc::new(f.store.clone()))
            .add_item(other, f.product, 1)
            .await
            .unwrap();
        let other_order = f
            .engine
            .create_from_cart(other, CheckoutMetadata::default())
            .await
            .unwrap();
        f.gateway
            .put("123", "pending", Some(f.order_id.to_string()));
        f.gateway
            .put("999", "approved", Some(other_order.id.to_string()));

        let body = json!({ "type": "payment", "data": { "id": "999" } });
        let notification = WebhookNotification::new(
            WebhookQuery {
                data_id: Some("123".to_string()),
                kind: Some("payment".to_string()),
                ..WebhookQuery::default()
            },
            body.to_string().as_bytes(),
            Some(sign("123", "req-1", "1")),
            Some("req-1".to_string()),
        );

        let outcome = f.reconciler.handle(&notification).await.unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Applied {
                order_id: f.order_id,
                payment_id: "123".to_string(),
                action: PaymentAction::MarkPending
            }
        );
        let untouched = f.store.find_order(other_order.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, OrderStatus::Pending);
        assert_eq!(untouched.payment_status, PaymentStatus::Pending);
        assert_eq!(stock(&f.store, f.product).await, 5);
    }

    #[tokio::test]
    async fn test_approved_payment_confirms_once() {
        let f = fixture(Some(SECRET)).await;
        f.gateway
            .put("123", "approved", Some(f.order_id.to_string()));
        let notification = payment_notification("123", Some(sign("123", "req-1", "1")));

        let first = f.reconciler.handle(&notification).await.unwrap();
        let second = f.reconciler.handle(&notification).await.unwrap();

        assert_eq!(
            first,
            WebhookOutcome::Applied {
                order_id: f.order_id,
                payment_id: "123".to_string(),
                action: PaymentAction::Confirm
            }
        );
        assert!(matches!(second, WebhookOutcome::Skipped { .. }));
        assert_eq!(stock(&f.store, f.product).await, 3);
        let order = f.store.find_order(f.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(order.payment_status, PaymentStatus::Approved);
        assert_eq!(order.payment_id.as_deref(), Some("123"));
    }

    #[tokio::test]
    async fn test_bad_signature_changes_nothing() {
        let f = fixture(Some(SECRET)).await;
        f.gateway
            .put("123", "approved", Some(f.order_id.to_string()));
        let forged = payment_notification("123", Some("ts=1,v1=00ff".to_string()));

        let err = f.reconciler.handle(&forged).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(*f.gateway.fetches.lock().unwrap(), 0);
        assert_eq!(stock(&f.store, f.product).await, 5);
    }

    #[tokio::test]
    async fn test_acknowledged_no_ops() {
        let f = fixture(None).await;

        let outcome = f
            .reconciler
            .handle(&payment_notification("404", None))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::PaymentNotFound { .. }));

        f.gateway.put("1", "approved", None);
        let outcome = f
            .reconciler
            .handle(&payment_notification("1", None))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));

        f.gateway
            .put("2", "approved", Some(OrderId::new().to_string()));
        let outcome = f
            .reconciler
            .handle(&payment_notification("2", None))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::OrderNotFound { .. }));

        f.gateway
            .put("3", "in_mediation", Some(f.order_id.to_string()));
        let outcome = f
            .reconciler
            .handle(&payment_notification("3", None))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Unhandled { .. }));

        let other = WebhookNotification::new(
            WebhookQuery::default(),
            br#"{"topic": "merchant_order", "id": 5}"#,
            None,
            None,
        );
        let outcome = f.reconciler.handle(&other).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));

        assert_eq!(stock(&f.store, f.product).await, 5);
    }

    #[tokio::test]
    async fn test_rejected_then_approved() {
        let f = fixture(None).await;
        f.gateway
            .put("10", "rejected", Some(f.order_id.to_string()));
        f.reconciler
            .handle(&payment_notification("10", None))
            .await
            .unwrap();
        let order = f.store.find_order(f.order_id).await.unwrap().unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Rejected);
        assert_eq!(order.status, OrderStatus::Pending);

        f.gateway
            .put("11", "approved", Some(f.order_id.to_string()));
        f.reconciler
            .handle(&payment_notification("11", None))
            .await
            .unwrap();
        let order = f.store.find_order(f.order_id).await.unwrap().unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Approved);
        assert_eq!(order.payment_id.as_deref(), Some("11"));
    }

    #[tokio::test]
    async fn test_cancelled_then_approved() {
        let f = fixture(Some(SECRET)).await;
        f.gateway
            .put("111", "cancelled", Some(f.order_id.to_string()));
        f.reconciler
            .handle(&payment_notification("111", Some(sign("111", "req-1", "1"))))
            .await
            .unwrap();
        let order = f.store.find_order(f.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.payment_status, PaymentStatus::Cancelled);

        f.gateway
            .put("222", "approved", Some(f.order_id.to_string()));
        let outcome = f
            .reconciler
            .handle(&payment_notification("222", Some(sign("222", "req-1", "1"))))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Applied {
                order_id: f.order_id,
                payment_id: "222".to_string(),
                action: PaymentAction::Confirm
            }
        );
        let order = f.store.find_order(f.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(order.payment_status, PaymentStatus::Approved);
        assert_eq!(stock(&f.store, f.product).await, 3);
    }

    #[tokio::test]
    async fn test_late_approval_for_cancelled_order_is_skipped() {
        let f = fixture(None).await;
        f.engine
            .update_status(f.order_id, OrderStatus::Cancelled)
            .await
            .unwrap();
        f.gateway
            .put("20", "approved", Some(f.order_id.to_string()));

        let outcome = f
            .reconciler
            .handle(&payment_notification("20", None))
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Skipped { .. }));
        assert_eq!(stock(&f.store, f.product).await, 5);
    }

    #[tokio::test]
    async fn test_stock_shortfall_surfaces_for_retry() {
        let f = fixture(None).await;
        let mut uow = f.store.begin().await.unwrap();
        assert!(uow.decrement_stock(f.product, 4).await.unwrap());
        uow.commit().await.unwrap();
        f.gateway
            .put("30", "approved", Some(f.order_id.to_string()));

        let err = f
            .reconciler
            .handle(&payment_notification("30", None))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InsufficientStock);
        let order = f.store.find_order(f.order_id).await.unwrap().unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_sync_payment_checks_reference() {
        let f = fixture(None).await;
        f.gateway
            .put("40", "approved", Some(OrderId::new().to_string()));

        let err = f
            .reconciler
            .sync_payment(f.order_id, "40")
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::ReferenceMismatch { .. }));

        let err = f
            .reconciler
            .sync_payment(f.order_id, "missing")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        f.gateway
            .put("41", "approved", Some(f.order_id.to_string()));
        let outcome = f.reconciler.sync_payment(f.order_id, "41").await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Applied { .. }));
        assert_eq!(stock(&f.store, f.product).await, 3);
    }
}
