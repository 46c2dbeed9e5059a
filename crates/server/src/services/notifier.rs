//! Order notifications.
//!
//! The order engine hands an [`OrderNotice`] to a [`Notifier`] after a state
//! change has been committed. Delivery is best effort: a notifier reports
//! success as a boolean and never fails the state change that triggered it.
//!
//! - [`EmailNotifier`] renders Askama templates and sends them over SMTP.
//! - [`LogNotifier`] renders the same email and writes it to the log; used
//!   when SMTP is not configured.

use std::sync::Arc;

use askama::Template;
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{MultiPart, SinglePart, header::ContentType},
    transport::smtp::{Error as SmtpError, authentication::Credentials},
};
use secrecy::ExposeSecret;
use serde::Serialize;
use thiserror::Error;

use kiosk_core::{OrderId, OrderStatus, Price};

use crate::config::{EmailConfig, ServerConfig};
use crate::models::{Customer, Order};

/// What the customer is told about an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderNotice {
    pub order_id: OrderId,
    pub customer_name: String,
    pub customer_email: String,
    pub total: Price,
    pub items: Vec<NoticeItem>,
    pub status: Option<OrderStatus>,
    /// Overrides the default label of `status`.
    pub status_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoticeItem {
    pub name: String,
    pub quantity: i32,
    pub unit_price: Price,
    pub line_total: Price,
}

impl OrderNotice {
    /// Build a notice for `order` as it stands now.
    #[must_use]
    pub fn for_order(order: &Order, customer: &Customer) -> Self {
        Self {
            order_id: order.id,
            customer_name: customer.name.clone(),
            customer_email: customer.email.clone(),
            total: order.total,
            items: order
                .items
                .iter()
                .map(|item| NoticeItem {
                    name: item.product_name.clone(),
                    quantity: item.quantity,
                    unit_price: item.unit_price,
                    line_total: item.line_total(),
                })
                .collect(),
            status: Some(order.status),
            status_label: None,
        }
    }

    /// Label shown in the subject line.
    #[must_use]
    pub fn label(&self) -> String {
        self.status_label
            .clone()
            .or_else(|| self.status.map(|status| status.label().to_string()))
            .unwrap_or_else(|| "Update".to_string())
    }

    /// Email subject: `Order #<short id> - <label>`.
    #[must_use]
    pub fn subject(&self) -> String {
        format!("Order #{} - {}", self.order_id.short(), self.label())
    }
}

/// Customer-facing sentence for a status.
#[must_use]
pub const fn status_message(status: Option<OrderStatus>) -> &'static str {
    match status {
        Some(OrderStatus::Pending) => {
            "We received your order and are waiting for the payment to be confirmed."
        }
        Some(OrderStatus::Confirmed) => {
            "Your payment was approved and your order is confirmed. We are preparing it now."
        }
        Some(OrderStatus::Shipped) => "Good news: your order is on its way.",
        Some(OrderStatus::Delivered) => "Your order was delivered. We hope you enjoy it!",
        Some(OrderStatus::Cancelled) => {
            "Your order was cancelled. If you were charged, the payment will be refunded."
        }
        None => "There is an update on your order.",
    }
}

/// Something that can tell a customer about their order.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `notice`. Returns `false` if delivery failed.
    async fn send_order_update(&self, notice: &OrderNotice) -> bool;
}

/// Store details shared by every rendered email.
#[derive(Debug, Clone)]
pub struct EmailBranding {
    pub app_name: String,
    pub frontend_url: String,
    pub currency: String,
}

/// HTML template for order status email.
#[derive(Template)]
#[template(path = "email/order_status.html")]
struct OrderStatusEmailHtml<'a> {
    subject: &'a str,
    app_name: &'a str,
    customer_name: &'a str,
    order_short: &'a str,
    status_label: &'a str,
    message: &'a str,
    items: &'a [NoticeItem],
    currency: &'a str,
    total: &'a Price,
    order_url: &'a str,
}

/// Plain text template for order status email.
#[derive(Template)]
#[template(path = "email/order_status.txt")]
struct OrderStatusEmailText<'a> {
    app_name: &'a str,
    customer_name: &'a str,
    order_short: &'a str,
    status_label: &'a str,
    message: &'a str,
    items: &'a [NoticeItem],
    currency: &'a str,
    total: &'a Price,
    order_url: &'a str,
}

/// A rendered email, ready to send or log.
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl EmailBranding {
    /// Render the status-update email for `notice`.
    ///
    /// # Errors
    ///
    /// Returns error if a template fails to render.
    pub fn render(&self, notice: &OrderNotice) -> Result<RenderedEmail, askama::Error> {
        let subject = notice.subject();
        let label = notice.label();
        let order_short = notice.order_id.short();
        let order_url = format!("{}/orders/{}", self.frontend_url, notice.order_id);
        let message = status_message(notice.status);

        let html = OrderStatusEmailHtml {
            subject: &subject,
            app_name: &self.app_name,
            customer_name: &notice.customer_name,
            order_short: &order_short,
            status_label: &label,
            message,
            items: &notice.items,
            currency: &self.currency,
            total: &notice.total,
            order_url: &order_url,
        }
        .render()?;

        let text = OrderStatusEmailText {
            app_name: &self.app_name,
            customer_name: &notice.customer_name,
            order_short: &order_short,
            status_label: &label,
            message,
            items: &notice.items,
            currency: &self.currency,
            total: &notice.total,
            order_url: &order_url,
        }
        .render()?;

        Ok(RenderedEmail {
            to: notice.customer_email.clone(),
            subject,
            text,
            html,
        })
    }
}

/// Errors that can occur when sending email.
#[derive(Debug, Error)]
pub enum EmailError {
    /// SMTP transport error.
    #[error("SMTP error: {0}")]
    Smtp(#[from] SmtpError),

    /// Failed to build email message.
    #[error("Failed to build message: {0}")]
    MessageBuild(#[from] lettre::error::Error),

    /// Invalid email address.
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    /// Template rendering error.
    #[error("Template error: {0}")]
    Template(#[from] askama::Error),
}

/// Sends order emails over SMTP.
#[derive(Clone)]
pub struct EmailNotifier {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from_address: String,
    branding: EmailBranding,
}

impl EmailNotifier {
    /// Create a new email notifier from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the SMTP transport cannot be built.
    pub fn new(config: &EmailConfig, branding: EmailBranding) -> Result<Self, SmtpError> {
        let credentials = Credentials::new(
            config.smtp_username.clone(),
            config.smtp_password.expose_secret().to_string(),
        );

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)?
            .port(config.smtp_port)
            .credentials(credentials)
            .build();

        Ok(Self {
            mailer,
            from_address: config.from_address.clone(),
            branding,
        })
    }

    async fn send(&self, notice: &OrderNotice) -> Result<(), EmailError> {
        let email = self.branding.render(notice)?;

        let message = Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|_| EmailError::InvalidAddress(self.from_address.clone()))?,
            )
            .to(email
                .to
                .parse()
                .map_err(|_| EmailError::InvalidAddress(email.to.clone()))?)
            .subject(&email.subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.html),
                    ),
            )?;

        self.mailer.send(message).await?;

        tracing::info!(to = %email.to, subject = %email.subject, "Email sent successfully");
        Ok(())
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send_order_update(&self, notice: &OrderNotice) -> bool {
        match self.send(notice).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    order_id = %notice.order_id,
                    error = %e,
                    "Failed to send order email"
                );
                false
            }
        }
    }
}

/// Writes order emails to the log instead of sending them.
#[derive(Debug, Clone)]
pub struct LogNotifier {
    branding: EmailBranding,
}

impl LogNotifier {
    #[must_use]
    pub const fn new(branding: EmailBranding) -> Self {
        Self { branding }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_order_update(&self, notice: &OrderNotice) -> bool {
        match self.branding.render(notice) {
            Ok(email) => {
                tracing::info!(
                    order_id = %notice.order_id,
                    to = %email.to,
                    subject = %email.subject,
                    body = %email.text,
                    "SMTP not configured; logging order email"
                );
                true
            }
            Err(e) => {
                tracing::warn!(order_id = %notice.order_id, error = %e, "Failed to render order email");
                false
            }
        }
    }
}

/// The notifier for this deployment: SMTP when configured, the log otherwise.
#[must_use]
pub fn from_config(config: &ServerConfig) -> Arc<dyn Notifier> {
    let branding = EmailBranding {
        app_name: config.app_name.clone(),
        frontend_url: config.frontend_url.clone(),
        currency: config.payments.currency.clone(),
    };

    match &config.email {
        Some(email) => match EmailNotifier::new(email, branding.clone()) {
            Ok(notifier) => {
                tracing::info!(smtp_host = %email.smtp_host, "Email notifications enabled");
                Arc::new(notifier)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to build SMTP transport; logging emails instead");
                Arc::new(LogNotifier::new(branding))
            }
        },
        None => Arc::new(LogNotifier::new(branding)),
    }
}
