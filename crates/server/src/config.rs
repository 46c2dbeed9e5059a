//! Server configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `DATABASE_URL` - `PostgreSQL` connection string (`KIOSK_DATABASE_URL` takes precedence)
//! - `MERCADOPAGO_ACCESS_TOKEN` - Payment processor access token
//!
//! ## Optional
//! - `KIOSK_HOST` - Bind address (default: 127.0.0.1)
//! - `KIOSK_PORT` - Listen port (default: 3000)
//! - `APP_NAME` - Store name used in emails (default: Kiosk)
//! - `FRONTEND_URL` - Public storefront URL for redirects (default: <http://localhost:3001>)
//! - `BACKEND_URL` - Public URL of this server for webhooks (default: <http://localhost:3000>)
//! - `MERCADOPAGO_API_URL` - Processor API base URL (default: <https://api.mercadopago.com>)
//! - `MERCADOPAGO_TIMEOUT_SECS` - Upper bound for every processor call (default: 10)
//! - `MERCADOPAGO_WEBHOOK_SECRET` - Webhook signing secret (unset disables verification)
//! - `STORE_CURRENCY` - ISO 4217 currency of every price (default: ARS)
//! - `STATEMENT_DESCRIPTOR` - Card statement text (default: KIOSK)
//! - `ORDER_EXPIRATION_HOURS` - Unpaid orders older than this are cancelled (default: 24)
//! - `ORDER_SWEEP_INTERVAL_SECS` - How often the sweeper runs (default: 3600)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//!
//! ## Optional (SMTP - emails are logged when unset)
//! - `SMTP_HOST` - SMTP server hostname
//! - `SMTP_PORT` - SMTP port (default: 587)
//! - `SMTP_USERNAME` - SMTP authentication username
//! - `SMTP_PASSWORD` - SMTP authentication password
//! - `SMTP_FROM` - Email sender address

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

const DEFAULT_API_URL: &str = "https://api.mercadopago.com";

/// Placeholder tokens shipped in sample `.env` files (case-insensitive).
const PLACEHOLDER_PATTERNS: &[&str] = &[
    "app_usr-xxx",
    "your-",
    "changeme",
    "replace",
    "placeholder",
    "todo",
    "insert",
    "put-your",
];

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Insecure secret in {0}: {1}")]
    InsecureSecret(String, String),
}

/// Server application configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: SecretString,
    /// IP address to bind the server to
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Store name shown to customers
    pub app_name: String,
    /// Public storefront URL (checkout redirects, order links)
    pub frontend_url: String,
    /// Public URL of this server (webhook notification URL)
    pub backend_url: String,
    /// Payment processor configuration
    pub payments: PaymentsConfig,
    /// Expiration sweeper configuration
    pub sweeper: SweeperConfig,
    /// Email configuration (optional - emails are logged when absent)
    pub email: Option<EmailConfig>,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment (e.g., "development", "staging", "production")
    pub sentry_environment: Option<String>,
    /// Sentry error sample rate (0.0 to 1.0)
    pub sentry_sample_rate: f32,
    /// Sentry traces sample rate for performance monitoring (0.0 to 1.0)
    pub sentry_traces_sample_rate: f32,
}

/// Payment processor configuration.
///
/// Implements `Debug` manually to redact the access token and webhook secret.
#[derive(Clone)]
pub struct PaymentsConfig {
    /// API base URL
    pub api_url: String,
    /// Bearer access token
    pub access_token: SecretString,
    /// Shared secret for webhook signatures. `None` skips verification.
    pub webhook_secret: Option<SecretString>,
    /// Timeout applied to every outbound call
    pub timeout: Duration,
    /// ISO 4217 currency sent with every line item
    pub currency: String,
    /// Text shown on the buyer's card statement
    pub statement_descriptor: String,
}

impl std::fmt::Debug for PaymentsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentsConfig")
            .field("api_url", &self.api_url)
            .field("access_token", &"[REDACTED]")
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("timeout", &self.timeout)
            .field("currency", &self.currency)
            .field("statement_descriptor", &self.statement_descriptor)
            .finish()
    }
}

/// Expiration sweeper configuration.
#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    /// Age after which an unpaid order is cancelled
    pub expiration: chrono::Duration,
    /// Time between sweeps
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            expiration: chrono::Duration::hours(24),
            interval: Duration::from_secs(3600),
        }
    }
}

/// Email (SMTP) configuration.
///
/// Implements `Debug` manually to redact the password.
#[derive(Clone)]
pub struct EmailConfig {
    /// SMTP server hostname
    pub smtp_host: String,
    /// SMTP server port
    pub smtp_port: u16,
    /// SMTP authentication username
    pub smtp_username: String,
    /// SMTP authentication password
    pub smtp_password: SecretString,
    /// Email sender address (From header)
    pub from_address: String,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("smtp_username", &self.smtp_username)
            .field("smtp_password", &"[REDACTED]")
            .field("from_address", &self.from_address)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing, invalid, or
    /// if the access token is a placeholder.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database_url = get_database_url("KIOSK_DATABASE_URL")?;
        let host = get_env_or_default("KIOSK_HOST", "127.0.0.1")
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::InvalidEnvVar("KIOSK_HOST".to_string(), e.to_string()))?;
        let port = parse_env("KIOSK_PORT", "3000")?;
        let frontend_url = parse_url("FRONTEND_URL", "http://localhost:3001")?;
        let backend_url = parse_url("BACKEND_URL", "http://localhost:3000")?;

        let payments = PaymentsConfig::from_env()?;
        let sweeper = SweeperConfig::from_env()?;
        let email = EmailConfig::from_env()?;

        Ok(Self {
            database_url,
            host,
            port,
            app_name: get_env_or_default("APP_NAME", "Kiosk"),
            frontend_url,
            backend_url,
            payments,
            sweeper,
            email,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
            sentry_sample_rate: get_optional_env("SENTRY_SAMPLE_RATE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0),
            sentry_traces_sample_rate: get_optional_env("SENTRY_TRACES_SAMPLE_RATE")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1.0),
        })
    }

    /// Returns the socket address for binding the server.
    #[must_use]
    pub const fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// URL the processor posts payment notifications to.
    #[must_use]
    pub fn notification_url(&self) -> String {
        format!("{}/api/payments/webhook", self.backend_url)
    }
}

impl PaymentsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let access_token = get_required_env("MERCADOPAGO_ACCESS_TOKEN")?;
        reject_placeholder(&access_token, "MERCADOPAGO_ACCESS_TOKEN")?;

        let webhook_secret = get_optional_env("MERCADOPAGO_WEBHOOK_SECRET")
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from);
        if webhook_secret.is_none() {
            tracing::warn!(
                "MERCADOPAGO_WEBHOOK_SECRET not configured; webhook signature verification will be skipped"
            );
        }

        let timeout_secs: u64 = parse_env("MERCADOPAGO_TIMEOUT_SECS", "10")?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidEnvVar(
                "MERCADOPAGO_TIMEOUT_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            api_url: parse_url("MERCADOPAGO_API_URL", DEFAULT_API_URL)?,
            access_token: SecretString::from(access_token),
            webhook_secret,
            timeout: Duration::from_secs(timeout_secs),
            currency: get_env_or_default("STORE_CURRENCY", "ARS").to_uppercase(),
            statement_descriptor: get_env_or_default("STATEMENT_DESCRIPTOR", "KIOSK"),
        })
    }

    /// Whether the configured access token is a processor test credential.
    #[must_use]
    pub fn is_sandbox(&self) -> bool {
        self.access_token.expose_secret().starts_with("TEST-")
    }
}

impl SweeperConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let hours: i64 = parse_env("ORDER_EXPIRATION_HOURS", "24")?;
        let interval_secs: u64 = parse_env("ORDER_SWEEP_INTERVAL_SECS", "3600")?;

        if hours <= 0 {
            return Err(ConfigError::InvalidEnvVar(
                "ORDER_EXPIRATION_HOURS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if interval_secs == 0 {
            return Err(ConfigError::InvalidEnvVar(
                "ORDER_SWEEP_INTERVAL_SECS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            expiration: chrono::Duration::hours(hours),
            interval: Duration::from_secs(interval_secs),
        })
    }
}

impl EmailConfig {
    /// Load SMTP configuration.
    ///
    /// Returns `None` when no SMTP variable is set. Host, username, password
    /// and sender must be set together.
    fn from_env() -> Result<Option<Self>, ConfigError> {
        let host = get_optional_env("SMTP_HOST");
        let username = get_optional_env("SMTP_USERNAME");
        let password = get_optional_env("SMTP_PASSWORD");
        let from = get_optional_env("SMTP_FROM");

        match (host, username, password, from) {
            (Some(smtp_host), Some(smtp_username), Some(password), Some(from_address)) => {
                Ok(Some(Self {
                    smtp_host,
                    smtp_port: parse_env("SMTP_PORT", "587")?,
                    smtp_username,
                    smtp_password: SecretString::from(password),
                    from_address,
                }))
            }
            (None, None, None, None) => {
                tracing::warn!("SMTP not configured; emails will be logged instead of sent");
                Ok(None)
            }
            _ => Err(ConfigError::InvalidEnvVar(
                "SMTP_*".to_string(),
                "SMTP_HOST, SMTP_USERNAME, SMTP_PASSWORD and SMTP_FROM must be set together"
                    .to_string(),
            )),
        }
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get a required environment variable.
fn get_required_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Get database URL with fallback to generic `DATABASE_URL`.
fn get_database_url(primary_key: &str) -> Result<SecretString, ConfigError> {
    if let Ok(value) = std::env::var(primary_key) {
        return Ok(SecretString::from(value));
    }
    if let Ok(value) = std::env::var("DATABASE_URL") {
        return Ok(SecretString::from(value));
    }
    Err(ConfigError::MissingEnvVar("DATABASE_URL".to_string()))
}

/// Get an optional environment variable.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Get an environment variable with a default value.
fn get_env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an environment variable (or its default) into `T`.
fn parse_env<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env_or_default(key, default)
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

/// An absolute http(s) base URL, without trailing slashes.
fn parse_url(key: &str, default: &str) -> Result<String, ConfigError> {
    let raw = get_env_or_default(key, default);
    check_url(&raw).map_err(|reason| ConfigError::InvalidEnvVar(key.to_string(), reason))
}

fn check_url(raw: &str) -> Result<String, String> {
    let url = url::Url::parse(raw.trim()).map_err(|e| e.to_string())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err("must not carry a query or fragment".to_string());
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

/// Refuse obvious placeholder credentials.
fn reject_placeholder(secret: &str, var_name: &str) -> Result<(), ConfigError> {
    let lower = secret.trim().to_lowercase();

    if lower.is_empty() {
        return Err(ConfigError::InsecureSecret(
            var_name.to_string(),
            "is empty".to_string(),
        ));
    }

    for pattern in PLACEHOLDER_PATTERNS {
        if lower.contains(pattern) {
            return Err(ConfigError::InsecureSecret(
                var_name.to_string(),
                format!("appears to be a placeholder (contains '{pattern}')"),
            ));
        }
    }

    Ok(())
}
