//! A first-party reverse proxy with a pluggable request-transformation
//! pipeline.
//!
//! # Architecture Overview
//!
//! ```text
//!   Client Request        ┌──────────────────────────────────────────────┐
//!   ────────────────────▶ │ service ──▶ engine.prepare ──▶ plugin chain  │
//!                         │                                     │        │
//!                         │                                     ▼        │
//!   Client Response       │            engine.forward ◀─────────┘        │
//!   ◀──────────────────── │               │        │                     │
//!                         └───────────────┼────────┼─────────────────────┘
//!                                  HTTP   │        │  WebSocket
//!                                  round  ▼        ▼  byte tunnel
//!                                      Target origin
//! ```
//!
//! Requests are prepared (cookies stripped and captured, URL pointed at the
//! configured target), then run through the plugin chain in registration
//! order, and finally forwarded by the engine unless a plugin already
//! serviced them. Configuration is a YAML document with one section per
//! plugin plus the core `relay` section, with environment variables
//! substituted into the source before parsing.

pub mod config;
pub mod env;
pub mod plugin;
pub mod plugins;
pub mod relay;
pub mod service;

pub use config::{read_options, Document, Options};
pub use relay::RelayEngine;
pub use service::{KeepAliveListener, RelayService};
