//! Kiosk order service library.
//!
//! Checkout, payment reconciliation and order expiration for the Kiosk
//! store, exposed as a library so the binary, the operator CLI and the
//! integration tests share one implementation.

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod payments;
pub mod routes;
pub mod services;
pub mod state;
pub mod sweeper;
