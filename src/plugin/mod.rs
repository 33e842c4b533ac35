//! The traffic plugin contract.
//!
//! Plugins inspect and transform requests on their way to the forwarding
//! engine. A plugin may ignore a request, alter it in some way, or service
//! it outright by producing a response of its own, in which case nothing
//! downstream (including the engine) writes to the client.

mod loader;
mod registry;

pub use loader::load;
pub use registry::{default_factories, is_registered, TEST_PLUGIN_NAMES};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Uri};
use axum::response::Response;

use crate::config::{ConfigError, Section};

/// Additional information about an incoming request, shared read-only with
/// every plugin in the chain.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// The original `Cookie` header values included in the client request.
    /// For security and privacy reasons, these are removed from the request
    /// before plugins get an opportunity to handle it; the cookies plugin
    /// is the mechanism that restores allowlisted ones.
    pub original_cookie_headers: Vec<String>,

    /// The original URL requested by the client, before any redirection by
    /// the relay.
    pub original_url: Uri,

    /// True once a response has been produced for the client. Never reset
    /// within a request's lifetime.
    pub serviced: bool,
}

/// The interface the relay uses to create plugin instances.
pub trait PluginFactory: Send + Sync {
    /// A stable name for this plugin, like "cookies" or "paths". This is
    /// also the name of the configuration section the plugin reads.
    fn name(&self) -> &'static str;

    /// Configures and returns an instance of this plugin, reading options
    /// from the given configuration section.
    ///
    /// Factories may return `Ok(None)` if the plugin should be inactive
    /// given the provided configuration; that is not an error.
    fn new_plugin(&self, section: &Section) -> Result<Option<Box<dyn Plugin>>, ConfigError>;
}

/// The interface exposed by plugin instances.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// A stable name for this plugin. Matches the factory's name.
    fn name(&self) -> &'static str;

    /// Handles an incoming traffic request.
    ///
    /// A plugin may mutate `request` regardless of what it returns, but
    /// must not write to the client unless it is servicing the request:
    /// returning `Some(response)` means the plugin has produced a complete
    /// response and downstream plugins and the forwarding engine must not.
    /// Plugins should leave requests that are already serviced
    /// (`info.serviced`) untouched.
    async fn handle_request(
        &self,
        request: &mut Request<Body>,
        info: &RequestInfo,
    ) -> Option<Response>;
}
