//! Business services.
//!
//! - [`orders`] - Order engine (checkout, payment and status transitions)
//! - [`cart`] - Per-user cart store
//! - [`notifier`] - Best-effort customer notifications

pub mod cart;
pub mod notifier;
pub mod orders;

pub use cart::CartService;
pub use notifier::{EmailBranding, EmailNotifier, LogNotifier, Notifier, OrderNotice};
pub use orders::{OrderEngine, OrderError};
