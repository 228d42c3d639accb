//! sitehubd: central hub for a fleet of managed WordPress sites.
//!
//! Agents register, report health and inventory, and submit errors; the hub
//! keeps client state in SQLite, derives status, opens tickets from error
//! patterns, publishes per-client DNS and sends scan/update commands back.

pub mod api;
pub mod clock;
pub mod commands;
pub mod config;
pub mod correlation;
pub mod dns;
pub mod error;
pub mod hub;
pub mod locks;
pub mod model;
pub mod monitor;
pub mod registry;
pub mod store;
pub mod store_manager;
