//! Database module for alertfleet.
//!
//! Relational store of alerts, rules and history, with embedded migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
