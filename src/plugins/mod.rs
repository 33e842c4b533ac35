//! First-party traffic plugins.
//!
//! Each plugin owns the configuration section matching its name. The
//! production set is enumerated in the plugin registry; `test_interceptor`
//! is test-only and never loads in production.

pub mod content_blocker;
pub mod cookies;
pub mod headers;
pub mod paths;
pub mod test_interceptor;
