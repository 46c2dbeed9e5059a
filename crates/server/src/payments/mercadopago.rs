//! `MercadoPago` HTTP client.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use secrecy::ExposeSecret;
use tracing::instrument;
use uuid::Uuid;

use super::{PaymentError, PaymentGateway, PaymentRecord, Preference, PreferenceRequest};
use crate::config::PaymentsConfig;

/// Header carrying a per-request idempotency key on writes.
const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// Longest error body kept in [`PaymentError::Api`].
const MAX_ERROR_BODY: usize = 512;

/// `MercadoPago` API client.
#[derive(Clone)]
pub struct MercadoPagoClient {
    inner: Arc<MercadoPagoClientInner>,
}

struct MercadoPagoClientInner {
    client: reqwest::Client,
    base_url: String,
    sandbox: bool,
}

impl MercadoPagoClient {
    /// Create a new client.
    ///
    /// Every request is bounded by `config.timeout`.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client fails to build.
    pub fn new(config: &PaymentsConfig) -> Result<Self, PaymentError> {
        let mut headers = HeaderMap::new();

        let auth_value = format!("Bearer {}", config.access_token.expose_secret());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value)
                .map_err(|e| PaymentError::Parse(format!("Invalid access token format: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(MercadoPagoClientInner {
                client,
                base_url: config.api_url.trim_end_matches('/').to_string(),
                sandbox: config.is_sandbox(),
            }),
        })
    }

    /// Whether the client runs against test credentials.
    #[must_use]
    pub fn is_sandbox(&self) -> bool {
        self.inner.sandbox
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, PaymentError> {
        let url = format!("{}{path}", self.inner.base_url);
        let response = self.inner.client.get(&url).send().await?;
        handle_response(response, path).await
    }

    async fn post<T: serde::de::DeserializeOwned, B: serde::Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PaymentError> {
        let url = format!("{}{path}", self.inner.base_url);
        let response = self
            .inner
            .client
            .post(&url)
            .header(IDEMPOTENCY_HEADER, Uuid::new_v4().to_string())
            .json(body)
            .send()
            .await?;
        handle_response(response, path).await
    }
}

#[async_trait]
impl PaymentGateway for MercadoPagoClient {
    #[instrument(skip(self, request), fields(external_reference = %request.external_reference))]
    async fn create_preference(
        &self,
        request: &PreferenceRequest,
    ) -> Result<Preference, PaymentError> {
        let preference: Preference = self.post("/checkout/preferences", request).await?;
        tracing::debug!(preference_id = %preference.id, "Preference created");
        Ok(preference)
    }

    #[instrument(skip(self))]
    async fn get_preference(&self, preference_id: &str) -> Result<Preference, PaymentError> {
        self.get(&format!("/checkout/preferences/{preference_id}"))
            .await
    }

    #[instrument(skip(self))]
    async fn fetch_payment(&self, payment_id: &str) -> Result<PaymentRecord, PaymentError> {
        self.get(&format!("/v1/payments/{payment_id}")).await
    }
}

/// Handle API response and parse JSON.
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> Result<T, PaymentError> {
    let status = response.status();

    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| PaymentError::Parse(format!("Failed to parse response: {e}")));
    }

    Err(parse_error(response, path).await)
}

/// Parse error response from the processor.
async fn parse_error(response: reqwest::Response, path: &str) -> PaymentError {
    let status = response.status().as_u16();

    if status == 401 || status == 403 {
        return PaymentError::Unauthorized;
    }

    if status == 404 {
        return PaymentError::NotFound(path.to_string());
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    PaymentError::Api {
        status,
        message: error_message(&body),
    }
}

/// Prefer the `message` field of a JSON error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| json.get("message")?.as_str().map(ToString::to_string))
        .unwrap_or_else(|| body.chars().take(MAX_ERROR_BODY).collect())
}

impl std::fmt::Debug for MercadoPagoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MercadoPagoClient")
            .field("base_url", &self.inner.base_url)
            .field("sandbox", &self.inner.sandbox)
            .finish_non_exhaustive()
    }
}
