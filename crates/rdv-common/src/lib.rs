//! Common types shared across the RDV relay stack.
//!
//! This crate provides:
//! - JSON envelope parsing and construction ([`envelope`])
//! - Connection identity and role types ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod envelope;
pub mod types;

pub use types::{ConnectionId, Role};
