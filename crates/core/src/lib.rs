//! Kiosk Core - Shared domain types.
//!
//! This crate provides the vocabulary shared by every Kiosk component:
//! - `server` - Order engine, payment reconciliation and the expiration sweeper
//! - `cli` - Operator tooling for migrations and admin overrides
//!
//! # Architecture
//!
//! The core crate contains only types and rules - no I/O, no database access,
//! no HTTP clients. The order and payment state machines live here so every
//! caller enforces the same transition tables.
//!
//! # Modules
//!
//! - [`types`] - Typed IDs, prices and the order/payment status machines

#![cfg_attr(not(test), forbid(unsafe_code))]

pub mod types;

pub use types::*;
