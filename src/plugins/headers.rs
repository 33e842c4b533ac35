//! Request header transformations.
//!
//! Currently one operation: overriding the `Origin` header to point at a
//! configured origin, using the outbound request scheme (rewritten to the
//! target scheme by the engine before plugins run).

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::ORIGIN;
use axum::http::{HeaderValue, Request};
use axum::response::Response;

use crate::config::{ConfigError, Section};
use crate::plugin::{Plugin, PluginFactory, RequestInfo};

pub struct HeadersFactory;

impl PluginFactory for HeadersFactory {
    fn name(&self) -> &'static str {
        "headers"
    }

    fn new_plugin(&self, section: &Section) -> Result<Option<Box<dyn Plugin>>, ConfigError> {
        let origin_override = match section.lookup_optional::<String>("override-origin")? {
            Some(value) => Some(value),
            None => section.lookup_optional::<String>("TRAFFIC_RELAY_ORIGIN_OVERRIDE")?,
        };

        let Some(origin_override) = origin_override else {
            return Ok(None);
        };

        tracing::info!(origin = %origin_override, "added rule: override \"Origin\" header");

        Ok(Some(Box::new(HeadersPlugin { origin_override })))
    }
}

struct HeadersPlugin {
    origin_override: String,
}

#[async_trait]
impl Plugin for HeadersPlugin {
    fn name(&self) -> &'static str {
        "headers"
    }

    async fn handle_request(
        &self,
        request: &mut Request<Body>,
        info: &RequestInfo,
    ) -> Option<Response> {
        if info.serviced {
            return None;
        }

        let scheme = request.uri().scheme_str().unwrap_or("http");
        if let Ok(value) = HeaderValue::from_str(&format!("{scheme}://{}", self.origin_override)) {
            request.headers_mut().insert(ORIGIN, value);
        }

        None
    }
}
