//! Configuration: the parsed document model and the relay's own options.
//!
//! # Responsibilities
//! - Hold the section/option document parsed from (substituted) YAML
//! - Provide typed lookups with missing/ill-typed reported distinctly
//! - Read the core `relay` section into engine and service options

mod document;
mod options;

pub use document::{ConfigError, Document, Section};
pub use options::{read_options, Options, RelayOptions, ServiceOptions, DEFAULT_MAX_BODY_SIZE};
