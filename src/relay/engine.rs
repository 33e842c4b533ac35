//! Request preparation and HTTP forwarding.

use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{CONNECTION, CONTENT_LENGTH, COOKIE, HOST, TRANSFER_ENCODING, UPGRADE};
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{HeaderValue, Request, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::config::RelayOptions;
use crate::plugin::RequestInfo;
use crate::relay::body::limit_bytes;
use crate::relay::upgrade;

pub const RELAY_VERSION_HEADER: &str = "X-Relay-Version";
pub const RELAY_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

/// Body sent with the 503 produced when the upstream declares a
/// Content-Length larger than the configured maximum.
const OVERSIZE_MESSAGE: &str = "Response body content-length was too large";

/// Errors raised while constructing the engine.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay target: {0}")]
    InvalidTarget(String),
    #[error("could not build the upstream HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// The core relay: rewrites incoming requests to point at the configured
/// target and forwards them, streaming the response back to the client.
pub struct RelayEngine {
    target_scheme: Scheme,
    target_authority: Authority,
    max_body_size: u64,
    client: reqwest::Client,
}

impl RelayEngine {
    pub fn new(options: &RelayOptions) -> Result<Self, RelayError> {
        let target_scheme = Scheme::try_from(options.target_scheme.as_str())
            .map_err(|e| RelayError::InvalidTarget(format!("{}: {e}", options.target_scheme)))?;
        let target_authority = Authority::try_from(options.target_host.as_str())
            .map_err(|e| RelayError::InvalidTarget(format!("{}: {e}", options.target_host)))?;

        // The client honors the ambient proxy environment and keeps its own
        // idle-connection pool.
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(2))
            .build()?;

        Ok(Self {
            target_scheme,
            target_authority,
            max_body_size: options.max_body_size,
            client,
        })
    }

    /// Prepares an incoming request before any plugin runs: captures the
    /// original URL and Cookie headers, unconditionally strips cookies
    /// (the cookies plugin restores allowlisted ones from the returned
    /// info), and rewrites the request to point at the target.
    pub fn prepare(&self, request: &mut Request<Body>) -> RequestInfo {
        let original_url = request.uri().clone();

        let original_cookie_headers: Vec<String> = request
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok().map(str::to_string))
            .collect();
        request.headers_mut().remove(COOKIE);

        let mut parts = request.uri().clone().into_parts();
        parts.scheme = Some(self.target_scheme.clone());
        parts.authority = Some(self.target_authority.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }
        if let Ok(uri) = Uri::from_parts(parts) {
            *request.uri_mut() = uri;
        }

        if let Ok(host) = HeaderValue::from_str(self.target_authority.as_str()) {
            request.headers_mut().insert(HOST, host);
        }

        RequestInfo {
            original_cookie_headers,
            original_url,
            serviced: false,
        }
    }

    /// Forwards a prepared request to the target, returning the response to
    /// relay. Returns `None` when the request is already serviced or the
    /// upstream round-trip failed (the dispatcher then answers 404).
    pub async fn forward(&self, mut request: Request<Body>, info: &RequestInfo) -> Option<Response> {
        if info.serviced {
            return None;
        }

        // A plugin could have rewritten the URL into something relative.
        if request.uri().scheme().is_none() || request.uri().authority().is_none() {
            return Some(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!(
                    "Cannot respond to relative (non-absolute) requests: {}",
                    request.uri()
                ),
            ));
        }

        self.add_forwarded_headers(&mut request);

        if request
            .headers()
            .get(UPGRADE)
            .is_some_and(|value| value.as_bytes() == b"websocket")
        {
            return Some(upgrade::handle_upgrade(request).await);
        }

        self.forward_http(request).await
    }

    /// Appends the X-Forwarded-* family and the relay version header.
    fn add_forwarded_headers(&self, request: &mut Request<Body>) {
        if let Some(ConnectInfo(crate::service::RemoteAddr(remote))) = request
            .extensions()
            .get::<ConnectInfo<crate::service::RemoteAddr>>()
            .copied()
        {
            if let Ok(value) = HeaderValue::from_str(&remote.ip().to_string()) {
                request.headers_mut().append("X-Forwarded-For", value);
            }
            request
                .headers_mut()
                .append("X-Forwarded-Port", HeaderValue::from(remote.port()));
        }

        if let Ok(proto) = HeaderValue::from_str(&protocol_name(request.version())) {
            request.headers_mut().append("X-Forwarded-Proto", proto);
        }

        request.headers_mut().append(
            RELAY_VERSION_HEADER,
            HeaderValue::from_static(RELAY_VERSION),
        );
    }

    async fn forward_http(&self, request: Request<Body>) -> Option<Response> {
        let (parts, request_body) = request.into_parts();
        let method = parts.method;
        let url = parts.uri.to_string();

        // reqwest derives the Host header from the URL, and re-frames any
        // body itself.
        let mut headers = parts.headers;
        headers.remove(HOST);
        headers.remove(CONNECTION);
        let request_has_body =
            headers.remove(TRANSFER_ENCODING).is_some() || headers.contains_key(CONTENT_LENGTH);

        let mut upstream_request = self
            .client
            .request(method.clone(), url.as_str())
            .headers(headers);
        if request_has_body {
            upstream_request = upstream_request
                .body(reqwest::Body::wrap_stream(request_body.into_data_stream()));
        }

        let upstream = match upstream_request.send().await {
            Ok(upstream) => upstream,
            Err(error) => {
                tracing::error!(%method, %url, %error, "cannot read response from server");
                return None;
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        // The relay re-frames the body itself.
        headers.remove(TRANSFER_ENCODING);
        headers.remove(CONNECTION);

        let declared_length = upstream
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        let response = match declared_length {
            Some(length) if length > self.max_body_size => {
                tracing::warn!(
                    length,
                    max_body_size = self.max_body_size,
                    "upstream content-length exceeds the maximum body size"
                );
                headers.remove(CONTENT_LENGTH);
                let mut response = Response::new(Body::from(OVERSIZE_MESSAGE));
                *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                *response.headers_mut() = headers;
                response
            }
            Some(0) => {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Some(length) => {
                let body = Body::from_stream(limit_bytes(upstream.bytes_stream(), length));
                let mut response = Response::new(body);
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            // Unknown length (e.g. chunked): stream no more than the
            // configured maximum, then end the body.
            None => {
                let body =
                    Body::from_stream(limit_bytes(upstream.bytes_stream(), self.max_body_size));
                let mut response = Response::new(body);
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
        };

        Some(response)
    }
}

/// The protocol name of an HTTP version string, lowercased: `HTTP/1.1`
/// becomes "http".
fn protocol_name(version: Version) -> String {
    let proto = format!("{version:?}");
    proto
        .split('/')
        .next()
        .unwrap_or("http")
        .to_ascii_lowercase()
}

pub(crate) fn text_response(status: StatusCode, message: String) -> Response {
    (status, message).into_response()
}
