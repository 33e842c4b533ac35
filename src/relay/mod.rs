//! The core forwarding engine.
//!
//! # Responsibilities
//! - Prepare incoming requests (cookie stripping, target rewrite)
//! - Round-trip HTTP requests to the configured target
//! - Stream responses back under the configured body-size bound
//! - Tunnel WebSocket upgrades as raw bytes

mod body;
mod engine;
mod upgrade;

pub use engine::{RelayEngine, RelayError, RELAY_VERSION, RELAY_VERSION_HEADER};
