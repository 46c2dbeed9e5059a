//! Kiosk order service.
//!
//! Serves the payment webhook and health checks, and runs the expiration
//! sweeper in the background.
//!
//! # Architecture
//!
//! - Axum web framework for the inbound webhook
//! - `PostgreSQL` for orders, carts and the inventory ledger
//! - `MercadoPago` Checkout Pro as the payment processor
//! - SMTP (lettre) for customer notifications, logged when not configured

#![cfg_attr(not(test), forbid(unsafe_code))]

use std::sync::Arc;

use sentry::integrations::tracing as sentry_tracing;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiosk_server::clock::{Clock, SystemClock};
use kiosk_server::config::ServerConfig;
use kiosk_server::db::{self, PgStore, Store};
use kiosk_server::payments::{MercadoPagoClient, SignatureVerifier, WebhookReconciler};
use kiosk_server::routes;
use kiosk_server::services::{OrderEngine, notifier};
use kiosk_server::state::AppState;
use kiosk_server::sweeper::ExpirationSweeper;

/// Initialize Sentry error tracking and return guard that must be kept alive.
fn init_sentry(config: &ServerConfig) -> Option<sentry::ClientInitGuard> {
    let dsn = config.sentry_dsn.as_ref()?;

    let guard = sentry::init((
        dsn.as_str(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: config
                .sentry_environment
                .clone()
                .map(std::borrow::Cow::Owned),
            sample_rate: config.sentry_sample_rate,
            traces_sample_rate: config.sentry_traces_sample_rate,
            attach_stacktrace: true,
            ..Default::default()
        },
    ));

    tracing::info!("Sentry initialized");
    Some(guard)
}

/// Filter tracing events to Sentry event types.
fn sentry_event_filter(metadata: &tracing::Metadata<'_>) -> sentry_tracing::EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR | tracing::Level::WARN => sentry_tracing::EventFilter::Event,
        tracing::Level::INFO | tracing::Level::DEBUG => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    }
}

#[tokio::main]
async fn main() {
    // Load configuration from environment (needed for Sentry init)
    let config = ServerConfig::from_env().expect("Failed to load configuration");

    // Initialize Sentry (must be done before tracing subscriber)
    let _sentry_guard = init_sentry(&config);

    // Defaults to info level for our crate if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kiosk_server=info,tower_http=debug".into());

    // JSON for log shippers, text locally
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    let json_layer =
        json_logs.then(|| tracing_subscriber::fmt::layer().json().flatten_event(true));
    let text_layer = (!json_logs).then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(sentry_tracing::layer().event_filter(sentry_event_filter))
        .init();

    // Initialize database connection pool
    let pool = db::create_pool(&config.database_url)
        .await
        .expect("Failed to create database pool");
    tracing::info!("Database pool created");

    // NOTE: Migrations are NOT run automatically on startup.
    // Run them explicitly via: cargo run -p kiosk-cli -- migrate

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = OrderEngine::new(Arc::clone(&store), notifier::from_config(&config), clock);

    let gateway =
        MercadoPagoClient::new(&config.payments).expect("Failed to create payment client");
    if gateway.is_sandbox() {
        tracing::warn!("Payment processor is using test credentials");
    }
    let reconciler = WebhookReconciler::new(
        engine.clone(),
        Arc::new(gateway),
        SignatureVerifier::new(config.payments.webhook_secret.clone()),
    );

    // Background sweeper, stopped together with the server
    let shutdown = CancellationToken::new();
    let sweeper = ExpirationSweeper::new(engine.clone(), config.sweeper).spawn(shutdown.clone());

    let state = AppState::new(store, reconciler);
    let app = routes::app(state)
        // Sentry layers (outermost for full request coverage)
        .layer(sentry_tower::NewSentryLayer::new_from_top())
        .layer(sentry_tower::SentryHttpLayer::new().enable_transaction());

    // Start server
    let addr = config.socket_addr();
    tracing::info!("kiosk-server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .expect("Server error");

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "Expiration sweeper task failed");
    }
    engine.flush_notifications().await;
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM), then stop background tasks.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
    shutdown.cancel();
}
