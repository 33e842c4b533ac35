//! Content blocking for request headers and bodies.
//!
//! Blocks content matching a regular expression from incoming request
//! bodies and headers. Four section options control it:
//!
//! - `TRAFFIC_EXCLUDE_BODY_CONTENT`: matching body content is deleted.
//! - `TRAFFIC_MASK_BODY_CONTENT`: matching body content is replaced with
//!   asterisks.
//! - `TRAFFIC_EXCLUDE_HEADER_CONTENT` / `TRAFFIC_MASK_HEADER_CONTENT`: the
//!   same, applied to header values.
//!
//! Masking does not change the positions of characters, which makes it less
//! likely to interfere with deserialization of the request body when complex
//! encodings are used; exclusion is more thorough. Which matters more
//! depends on the application.
//!
//! This plugin does not understand the format of the requests it processes;
//! it treats the entire body as text. A regular expression that matches
//! JSON, HTML, or CSS syntax may corrupt the request.
//!
//! Because it transforms requests, this plugin must run before the
//! forwarding engine.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, UPGRADE};
use axum::http::{HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use regex::bytes::Regex;

use crate::config::{ConfigError, Section};
use crate::plugin::{Plugin, PluginFactory, RequestInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockerMode {
    /// Replace each matched byte span with `*` repeated to match length.
    Mask,
    /// Delete matched bytes entirely.
    Exclude,
}

impl std::fmt::Display for BlockerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockerMode::Mask => write!(f, "mask"),
            BlockerMode::Exclude => write!(f, "exclude"),
        }
    }
}

/// Applies a content blocking transformation to content matching a regular
/// expression.
struct ContentBlocker {
    mode: BlockerMode,
    pattern: Regex,
}

impl ContentBlocker {
    fn block(&self, content: &[u8]) -> Vec<u8> {
        match self.mode {
            BlockerMode::Mask => self
                .pattern
                .replace_all(content, |caps: &regex::bytes::Captures| {
                    vec![b'*'; caps[0].len()]
                })
                .into_owned(),
            BlockerMode::Exclude => self
                .pattern
                .replace_all(content, regex::bytes::NoExpand(b""))
                .into_owned(),
        }
    }
}

pub struct ContentBlockerFactory;

impl PluginFactory for ContentBlockerFactory {
    fn name(&self) -> &'static str {
        "content-blocker"
    }

    fn new_plugin(&self, section: &Section) -> Result<Option<Box<dyn Plugin>>, ConfigError> {
        let body_blockers = blocker_list(
            section,
            "body",
            "TRAFFIC_EXCLUDE_BODY_CONTENT",
            "TRAFFIC_MASK_BODY_CONTENT",
        )?;
        let header_blockers = blocker_list(
            section,
            "header",
            "TRAFFIC_EXCLUDE_HEADER_CONTENT",
            "TRAFFIC_MASK_HEADER_CONTENT",
        )?;

        if body_blockers.is_empty() && header_blockers.is_empty() {
            return Ok(None);
        }

        Ok(Some(Box::new(ContentBlockerPlugin {
            body_blockers,
            header_blockers,
        })))
    }
}

/// Builds the group of blockers for one scope (body or header values),
/// exclusion first so masking sees its output.
fn blocker_list(
    section: &Section,
    scope: &str,
    exclude_key: &str,
    mask_key: &str,
) -> Result<Vec<ContentBlocker>, ConfigError> {
    let mut blockers = Vec::new();

    for (key, mode) in [(exclude_key, BlockerMode::Exclude), (mask_key, BlockerMode::Mask)] {
        section.parse_optional(key, |key, pattern: String| {
            let compiled = Regex::new(&pattern)
                .map_err(|e| format!("could not compile {key} regular expression: {e}"))?;
            tracing::info!(
                %mode,
                scope,
                pattern = %compiled,
                "content blocker will transform matching content"
            );
            blockers.push(ContentBlocker {
                mode,
                pattern: compiled,
            });
            Ok(())
        })?;
    }

    Ok(blockers)
}

struct ContentBlockerPlugin {
    body_blockers: Vec<ContentBlocker>,
    header_blockers: Vec<ContentBlocker>,
}

#[async_trait]
impl Plugin for ContentBlockerPlugin {
    fn name(&self) -> &'static str {
        "content-blocker"
    }

    async fn handle_request(
        &self,
        request: &mut Request<Body>,
        info: &RequestInfo,
    ) -> Option<Response> {
        if info.serviced {
            return None;
        }

        self.block_header_content(request);
        self.block_body_content(request).await
    }
}

impl ContentBlockerPlugin {
    /// Runs every header value through the header blockers. Header names
    /// are left untouched.
    fn block_header_content(&self, request: &mut Request<Body>) {
        if self.header_blockers.is_empty() {
            return;
        }

        let names: Vec<HeaderName> = request.headers().keys().cloned().collect();
        for name in names {
            let values: Vec<HeaderValue> =
                request.headers().get_all(&name).iter().cloned().collect();

            let mut changed = false;
            let blocked: Vec<HeaderValue> = values
                .iter()
                .map(|value| {
                    let mut content = value.as_bytes().to_vec();
                    for blocker in &self.header_blockers {
                        content = blocker.block(&content);
                    }
                    if content != value.as_bytes() {
                        changed = true;
                    }
                    // A transformed value can only become invalid if the
                    // pattern matched control bytes; blank it in that case.
                    HeaderValue::from_bytes(&content)
                        .unwrap_or_else(|_| HeaderValue::from_static(""))
                })
                .collect();

            if changed {
                request.headers_mut().remove(&name);
                for value in blocked {
                    request.headers_mut().append(name.clone(), value);
                }
            }
        }
    }

    /// Buffers the request body, runs it through the body blockers, and
    /// replaces it, updating Content-Length when the length changed.
    async fn block_body_content(&self, request: &mut Request<Body>) -> Option<Response> {
        if self.body_blockers.is_empty() {
            return None;
        }

        // Reject all websocket connections when body content is blocked.
        // The plugin pipeline has no hook for websocket frames, so there
        // would be no way to actually block anything; fail closed instead.
        if request
            .headers()
            .get(UPGRADE)
            .is_some_and(|v| v.as_bytes() == b"websocket")
        {
            tracing::warn!(
                url = %request.uri(),
                "rejecting websocket connection (content blocking is not supported with websockets)"
            );
            return Some(
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Blocking unsupported websocket connection: {}", request.uri()),
                )
                    .into_response(),
            );
        }

        let body = std::mem::replace(request.body_mut(), Body::empty());
        let buffered = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(buffered) => buffered,
            Err(error) => {
                return Some(
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Error reading request body: {error}"),
                    )
                        .into_response(),
                )
            }
        };

        let initial_length = buffered.len();
        let mut processed = buffered.to_vec();
        for blocker in &self.body_blockers {
            processed = blocker.block(&processed);
        }

        if processed.len() != initial_length {
            request
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from(processed.len()));
        }

        *request.body_mut() = Body::from(processed);
        None
    }
}
