//! RDV relay server — pairs one admin with many users over WebSocket and
//! forwards opaque JSON envelopes between them.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay server operations.
pub mod error;
mod lifecycle;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Session registry: identity allocation, role arbitration and the admin
/// key cache.
pub mod registry;
/// Envelope classification, peer resolution and forwarding.
pub mod router;
/// Accept loop and shared server state.
pub mod server;

pub use server::{run, run_with_shutdown, ServerState};
