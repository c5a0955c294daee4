//! VU1 Dial Bridge - Rust Implementation
//!
//! Keeps VU1 analog dials in sync with a local device registry and drives
//! them from numeric data sources.
//!
//! This library provides:
//! - VU1 server HTTP client
//! - Poll-and-reconcile coordinator with two-way name sync
//! - Per-dial configuration store with JSON persistence
//! - Sensor bindings with debounced dial updates
//! - MQTT bridge for source states and dial state
//! - Server-Sent Events for real-time updates

pub mod adapters;
pub mod api;
pub mod binding;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod dials;
pub mod registry;
pub mod sources;

#[cfg(test)]
pub(crate) mod testing;
