//! Domain models for the order and payment core.
//!
//! These are validated domain objects. Storage backends convert their own
//! row types into these before handing them to services.

pub mod cart;
pub mod order;
pub mod product;

pub use cart::{Cart, CartLine, CartSyncLine, CartView};
pub use order::{
    CheckoutMetadata, Order, OrderFilter, OrderItem, OrderPage, OrderStateUpdate, PageMeta,
    PaymentSnapshot,
};
pub use product::{Customer, Product};
