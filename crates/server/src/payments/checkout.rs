//! Checkout preference creation.
//!
//! A preference is the processor-hosted payment page for one order. Orders
//! remember their preference id so repeated clicks on the checkout button
//! reuse it instead of creating a new one each time.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use kiosk_core::{OrderId, OrderStatus, PaymentStatus, UserId};

use super::{
    BackUrls, Payer, PaymentError, PaymentGateway, Preference, PreferenceItem, PreferenceRequest,
};
use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::error::ErrorKind;
use crate::models::Order;
use crate::services::OrderError;

/// Longest item description the processor accepts.
const MAX_DESCRIPTION_CHARS: usize = 256;

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("order {0} is already paid")]
    AlreadyPaid(OrderId),

    #[error("order {order_id} is {status} and can no longer be paid")]
    OrderClosed {
        order_id: OrderId,
        status: OrderStatus,
    },

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Gateway(#[from] PaymentError),
}

impl CheckoutError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyPaid(_) | Self::OrderClosed { .. } => ErrorKind::InvalidState,
            Self::Order(err) => err.kind(),
            // Includes processor 404s: the caller's order exists.
            Self::Gateway(_) => ErrorKind::PaymentGateway,
        }
    }
}

/// Static inputs of every preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSettings {
    /// Storefront base URL for the back URLs.
    pub frontend_url: String,
    /// Where the processor posts payment notifications.
    pub notification_url: String,
    pub currency: String,
    pub statement_descriptor: String,
}

impl CheckoutSettings {
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            frontend_url: config.frontend_url.clone(),
            notification_url: config.notification_url(),
            currency: config.payments.currency.clone(),
            statement_descriptor: config.payments.statement_descriptor.clone(),
        }
    }

    fn back_urls(&self, order_id: OrderId) -> BackUrls {
        let url = |outcome: &str| {
            format!(
                "{}/checkout/{outcome}?order_id={order_id}",
                self.frontend_url
            )
        };
        BackUrls {
            success: url("success"),
            failure: url("failure"),
            pending: url("pending"),
        }
    }
}

/// Where to send the customer to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreferenceLink {
    pub order_id: OrderId,
    pub preference_id: String,
    pub init_point: String,
    pub sandbox_init_point: Option<String>,
    /// The stored preference was still valid and was returned as is.
    pub reused: bool,
}

impl PreferenceLink {
    fn new(order_id: OrderId, preference: Preference, reused: bool) -> Self {
        Self {
            order_id,
            preference_id: preference.id,
            init_point: preference.init_point,
            sandbox_init_point: preference.sandbox_init_point,
            reused,
        }
    }
}

/// Creates and reuses checkout preferences.
#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    settings: CheckoutSettings,
}

impl PaymentService {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        settings: CheckoutSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            settings,
        }
    }

    /// Payment link for one of the user's orders.
    ///
    /// The order row is only written after the processor accepted a new
    /// preference, so a failed or timed-out call leaves it untouched.
    ///
    /// # Errors
    ///
    /// - `OrderNotFound` if the order does not exist or belongs to someone else
    /// - `AlreadyPaid` / `OrderClosed` if the order can no longer be paid
    /// - `Gateway` if the processor fails; retry later
    #[instrument(skip(self), fields(user_id = %user_id, order_id = %order_id))]
    pub async fn create_preference(
        &self,
        user_id: UserId,
        order_id: OrderId,
    ) -> Result<PreferenceLink, CheckoutError> {
        let order = match self.store.find_order(order_id).await.map_err(OrderError::from)? {
            Some(order) if order.user_id == user_id => order,
            _ => return Err(OrderError::OrderNotFound(order_id).into()),
        };
        require_payable(&order)?;

        if let Some(preference_id) = order.preference_id.as_deref() {
            match self.gateway.get_preference(preference_id).await {
                Ok(preference) if references(&preference, order_id) => {
                    tracing::debug!(preference_id = %preference.id, "Reusing stored preference");
                    return Ok(PreferenceLink::new(order_id, preference, true));
                }
                Ok(_) => {
                    tracing::warn!(preference_id = %preference_id, "Stored preference references another order; replacing it");
                }
                Err(e) if e.is_stale() => {
                    tracing::info!(preference_id = %preference_id, error = %e, "Stored preference is stale; creating a new one");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let request = self.build_request(&order).await?;
        let preference = self.gateway.create_preference(&request).await?;

        self.store
            .set_preference_id(order_id, &preference.id, self.clock.now())
            .await
            .map_err(OrderError::from)?;

        tracing::info!(preference_id = %preference.id, "Preference created for order");
        Ok(PreferenceLink::new(order_id, preference, false))
    }

    async fn build_request(&self, order: &Order) -> Result<PreferenceRequest, CheckoutError> {
        let mut items = Vec::with_capacity(order.items.len());
        for item in &order.items {
            let description = self
                .store
                .find_product(item.product_id)
                .await
                .map_err(OrderError::from)?
                .and_then(|product| product.description)
                .map(|text| truncate_chars(&text, MAX_DESCRIPTION_CHARS))
                .filter(|text| !text.trim().is_empty())
                .unwrap_or_else(|| truncate_chars(&item.product_name, MAX_DESCRIPTION_CHARS));

            items.push(PreferenceItem {
                id: item.product_id.to_string(),
                title: item.product_name.clone(),
                description: Some(description),
                quantity: item.quantity,
                unit_price: item.unit_price.amount(),
                currency_id: self.settings.currency.clone(),
            });
        }

        let payer = self
            .store
            .find_customer(order.user_id)
            .await
            .map_err(OrderError::from)?
            .map(|customer| Payer {
                email: Some(customer.email),
                name: Some(customer.name),
            })
            .unwrap_or_default();

        Ok(PreferenceRequest {
            items,
            payer,
            back_urls: self.settings.back_urls(order.id),
            auto_return: "approved".to_string(),
            notification_url: self.settings.notification_url.clone(),
            external_reference: order.id.to_string(),
            statement_descriptor: self.settings.statement_descriptor.clone(),
        })
    }
}

fn require_payable(order: &Order) -> Result<(), CheckoutError> {
    if order.payment_status == PaymentStatus::Approved {
        return Err(CheckoutError::AlreadyPaid(order.id));
    }
    if order.status != OrderStatus::Pending {
        return Err(CheckoutError::OrderClosed {
            order_id: order.id,
            status: order.status,
        });
    }
    Ok(())
}

/// A preference without a reference predates the field; accept it.
fn references(preference: &Preference, order_id: OrderId) -> bool {
    preference
        .external_reference
        .as_deref()
        .is_none_or(|reference| reference == order_id.to_string())
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
