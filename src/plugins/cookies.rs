//! Cookie allowlisting for incoming requests.
//!
//! By default, all cookies are blocked: the relay strips `Cookie` headers
//! before any plugin runs. This is because in the context of the relay,
//! cookies are quite high-risk; it usually runs in a first-party context,
//! so the risk of receiving cookies that were intended for another service
//! is substantial. This plugin restores the cookies whose names appear in
//! the configured allowlist, and nothing else.

use std::collections::HashSet;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::COOKIE;
use axum::http::{HeaderValue, Request};
use axum::response::Response;

use crate::config::{ConfigError, Section};
use crate::plugin::{Plugin, PluginFactory, RequestInfo};

pub struct CookiesFactory;

impl PluginFactory for CookiesFactory {
    fn name(&self) -> &'static str {
        "cookies"
    }

    fn new_plugin(&self, section: &Section) -> Result<Option<Box<dyn Plugin>>, ConfigError> {
        let mut allowlist = HashSet::new();

        section.parse_optional("allowlist", |_, names: Vec<String>| {
            for name in names {
                tracing::info!(cookie = %name, "added rule: allowlist cookie");
                allowlist.insert(name);
            }
            Ok(())
        })?;

        section.parse_optional("TRAFFIC_RELAY_COOKIES", |_, names: String| {
            for name in names.split_whitespace() {
                tracing::info!(cookie = %name, "added rule: allowlist cookie");
                allowlist.insert(name.to_string());
            }
            Ok(())
        })?;

        if allowlist.is_empty() {
            return Ok(None);
        }

        Ok(Some(Box::new(CookiesPlugin { allowlist })))
    }
}

struct CookiesPlugin {
    /// The names of cookies that should be relayed.
    allowlist: HashSet<String>,
}

#[async_trait]
impl Plugin for CookiesPlugin {
    fn name(&self) -> &'static str {
        "cookies"
    }

    async fn handle_request(
        &self,
        request: &mut Request<Body>,
        info: &RequestInfo,
    ) -> Option<Response> {
        if info.serviced {
            return None;
        }

        // Parse the original Cookie headers (captured before the relay
        // stripped them) and keep the cookies present in the allowlist,
        // preserving their order of appearance and their values.
        let mut cookies = Vec::new();
        for header_value in &info.original_cookie_headers {
            for cookie in header_value.split(';') {
                let cookie = cookie.trim();
                let Some((name, _)) = cookie.split_once('=') else {
                    continue;
                };
                if self.allowlist.contains(name) {
                    cookies.push(cookie.to_string());
                }
            }
        }

        // Reserialize as a single Cookie header. If nothing survived the
        // allowlist, the request simply carries no Cookie header.
        if !cookies.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&cookies.join("; ")) {
                request.headers_mut().insert(COOKIE, value);
            }
        }

        None
    }
}
