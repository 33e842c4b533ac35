//! The compile-time plugin registry.

use crate::plugin::PluginFactory;
use crate::plugins::{
    content_blocker::ContentBlockerFactory, cookies::CookiesFactory, headers::HeadersFactory,
    paths::PathsFactory,
};

/// Names of test-only plugins. These are never loaded by the relay on
/// startup, but can be loaded programmatically in tests.
pub const TEST_PLUGIN_NAMES: &[&str] = &["test-interceptor"];

/// Returns factories for all traffic plugins available in production, in
/// the order they run. The forwarding engine always runs after the chain.
pub fn default_factories() -> Vec<Box<dyn PluginFactory>> {
    vec![
        Box::new(ContentBlockerFactory),
        Box::new(CookiesFactory),
        Box::new(HeadersFactory),
        Box::new(PathsFactory),
    ]
}

/// Returns true if a factory with the given name appears in the default
/// registry or the test-only registry. Checking this helps ensure that
/// newly-developed plugins get registered and are available for use in
/// production, and not just in unit tests.
pub fn is_registered(name: &str) -> bool {
    default_factories()
        .iter()
        .any(|factory| factory.name() == name)
        || TEST_PLUGIN_NAMES.contains(&name)
}
