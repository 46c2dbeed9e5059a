//! Application state shared across handlers.

use std::sync::Arc;

use crate::db::Store;
use crate::payments::WebhookReconciler;

/// Application state shared across all handlers.
///
/// This struct is cheaply cloneable via `Arc`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn Store>,
    reconciler: WebhookReconciler,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, reconciler: WebhookReconciler) -> Self {
        Self {
            inner: Arc::new(AppStateInner { store, reconciler }),
        }
    }

    /// Get a reference to the order store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Get a reference to the payment notification reconciler.
    #[must_use]
    pub fn reconciler(&self) -> &WebhookReconciler {
        &self.inner.reconciler
    }
}
