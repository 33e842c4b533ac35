//! Request URL rewriting.
//!
//! This plugin watches incoming traffic and optionally rewrites request URL
//! paths. The most common use is to remove or rewrite a path prefix. A rule
//! matches a regular expression against the request path and either
//! substitutes within the path (leaving scheme, host, and query untouched)
//! or, for URL rules, replaces the entire target URL (query preserved).

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::HOST;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{HeaderValue, Request, Uri};
use axum::response::Response;
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::config::{ConfigError, Section};
use crate::plugin::{Plugin, PluginFactory, RequestInfo};

#[derive(Debug, Deserialize)]
struct ConfigRouteRule {
    path: String,
    #[serde(rename = "target-path", default)]
    target_path: Option<String>,
    #[serde(rename = "target-url", default)]
    target_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleTarget {
    /// Substitute the matched portion of the path.
    Path,
    /// Replace the whole URL (except query params) with the replacement.
    Url,
}

impl std::fmt::Display for RuleTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleTarget::Path => write!(f, "path"),
            RuleTarget::Url => write!(f, "URL"),
        }
    }
}

struct PathRule {
    matcher: Regex,
    replacement: String,
    target: RuleTarget,
}

pub struct PathsFactory;

impl PluginFactory for PathsFactory {
    fn name(&self) -> &'static str {
        "paths"
    }

    fn new_plugin(&self, section: &Section) -> Result<Option<Box<dyn Plugin>>, ConfigError> {
        let mut rules = Vec::new();

        section.parse_optional("routes", |_, configured: Vec<ConfigRouteRule>| {
            add_rules(&mut rules, configured)
        })?;
        add_traffic_paths_rule(section, &mut rules)?;
        add_specials_rules(section, &mut rules)?;

        if rules.is_empty() {
            return Ok(None);
        }

        Ok(Some(Box::new(PathsPlugin { rules })))
    }
}

/// Compiles configured rules, preserving declaration order.
fn add_rules(
    rules: &mut Vec<PathRule>,
    configured: Vec<ConfigRouteRule>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for rule in configured {
        let (replacement, target) = match (rule.target_path, rule.target_url) {
            (None, None) => {
                return Err(format!("route for path \"{}\" has no target", rule.path).into())
            }
            (Some(_), Some(_)) => {
                return Err(
                    format!("route for path \"{}\" has multiple targets", rule.path).into(),
                )
            }
            (Some(path), None) => (path, RuleTarget::Path),
            (None, Some(url)) => (url, RuleTarget::Url),
        };

        let matcher = Regex::new(&rule.path).map_err(|e| {
            format!(
                "could not compile path regular expression \"{}\": {e}",
                rule.path
            )
        })?;

        tracing::info!(
            rule = %matcher,
            target = %target,
            replacement = %replacement,
            "added rule: route"
        );
        rules.push(PathRule {
            matcher,
            replacement,
            target,
        });
    }

    Ok(())
}

/// Reads a path rule defined with the `TRAFFIC_PATHS_MATCH` and
/// `TRAFFIC_PATHS_REPLACEMENT` options, if one exists. Since a replacement
/// without a match expression wouldn't do anything, the match option is
/// only required once a replacement is present.
fn add_traffic_paths_rule(
    section: &Section,
    rules: &mut Vec<PathRule>,
) -> Result<(), ConfigError> {
    let Some(replacement) = section.lookup_optional::<String>("TRAFFIC_PATHS_REPLACEMENT")? else {
        return Ok(());
    };

    section.parse_required("TRAFFIC_PATHS_MATCH", |_, pattern: String| {
        add_rules(
            rules,
            vec![ConfigRouteRule {
                path: pattern,
                target_path: Some(replacement),
                target_url: None,
            }],
        )
    })
}

/// Reads URL rules defined with the `TRAFFIC_RELAY_SPECIALS` option, if
/// present: whitespace-separated `regex url` pairs.
fn add_specials_rules(section: &Section, rules: &mut Vec<PathRule>) -> Result<(), ConfigError> {
    section.parse_optional("TRAFFIC_RELAY_SPECIALS", |_, value: String| {
        let tokens: Vec<&str> = value.split_whitespace().collect();
        if tokens.len() % 2 != 0 {
            return Err("last key has no value".into());
        }

        let configured = tokens
            .chunks(2)
            .map(|pair| ConfigRouteRule {
                path: pair[0].to_string(),
                target_path: None,
                target_url: Some(pair[1].to_string()),
            })
            .collect();

        add_rules(rules, configured)
    })
}

struct PathsPlugin {
    rules: Vec<PathRule>,
}

#[async_trait]
impl Plugin for PathsPlugin {
    fn name(&self) -> &'static str {
        "paths"
    }

    async fn handle_request(
        &self,
        request: &mut Request<Body>,
        info: &RequestInfo,
    ) -> Option<Response> {
        if info.serviced {
            return None;
        }

        for rule in &self.rules {
            match rule.target {
                RuleTarget::Path => {
                    // If there's a match, replace the requested URL's path.
                    let path = request.uri().path().to_string();
                    let new_path = rule.matcher.replace_all(&path, rule.replacement.as_str());
                    if new_path != path {
                        set_request_path(request, &new_path);
                    }
                }
                RuleTarget::Url => {
                    if !rule.matcher.is_match(request.uri().path()) {
                        continue;
                    }

                    // Replace the entire URL, except for query params. The
                    // path is the input to the replacement so that capture
                    // groups from the path can be referenced.
                    let path = request.uri().path().to_string();
                    let replaced = rule.matcher.replace_all(&path, rule.replacement.as_str());
                    match Url::parse(&replaced) {
                        Ok(url) => set_request_url(request, &url),
                        Err(error) => {
                            tracing::warn!(
                                rule = %rule.matcher,
                                produced = %replaced,
                                %error,
                                "failed to create URL for path rule"
                            );
                        }
                    }
                }
            }
        }

        None
    }
}

/// Replaces the path portion of the request URI, keeping the query string.
fn set_request_path(request: &mut Request<Body>, new_path: &str) {
    let path_and_query = match request.uri().query() {
        Some(query) => format!("{new_path}?{query}"),
        None => new_path.to_string(),
    };

    let path_and_query = match PathAndQuery::try_from(path_and_query.as_str()) {
        Ok(pq) => pq,
        Err(error) => {
            tracing::warn!(path = %new_path, %error, "rewritten path is not a valid URI path");
            return;
        }
    };

    let mut parts = request.uri().clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    if let Ok(uri) = Uri::from_parts(parts) {
        *request.uri_mut() = uri;
    }
}

/// Replaces the scheme, authority, and path of the request URI with those
/// of `url`, keeping the query string, and updates the Host header.
fn set_request_url(request: &mut Request<Body>, url: &Url) {
    let Some(host) = url.host_str() else {
        tracing::warn!(url = %url, "path rule target URL has no host");
        return;
    };
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let (scheme, authority) = match (
        Scheme::try_from(url.scheme()),
        Authority::try_from(authority.as_str()),
    ) {
        (Ok(scheme), Ok(authority)) => (scheme, authority),
        _ => {
            tracing::warn!(url = %url, "path rule target URL is not a valid URI");
            return;
        }
    };

    let path_and_query = match request.uri().query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    };
    let Ok(path_and_query) = PathAndQuery::try_from(path_and_query.as_str()) else {
        tracing::warn!(url = %url, "path rule target URL has an invalid path");
        return;
    };

    let mut parts = request.uri().clone().into_parts();
    parts.scheme = Some(scheme);
    parts.authority = Some(authority.clone());
    parts.path_and_query = Some(path_and_query);
    if let Ok(uri) = Uri::from_parts(parts) {
        *request.uri_mut() = uri;
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            request.headers_mut().insert(HOST, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Document;

    fn plugin(yaml: &str) -> Option<Box<dyn Plugin>> {
        let document = Document::from_yaml_str(yaml).unwrap();
        PathsFactory.new_plugin(&document.section("paths")).unwrap()
    }

    fn info() -> RequestInfo {
        RequestInfo {
            original_cookie_headers: Vec::new(),
            original_url: Uri::from_static("http://relay/"),
            serviced: false,
        }
    }

    async fn rewritten(plugin: &dyn Plugin, uri: &str) -> Uri {
        let mut request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        assert!(plugin.handle_request(&mut request, &info()).await.is_none());
        request.uri().clone()
    }

    #[test]
    fn no_rules_is_inactive() {
        assert!(plugin("paths: {}\n").is_none());
    }

    #[test]
    fn rules_need_exactly_one_target() {
        let document = Document::from_yaml_str(
            "paths:\n  routes:\n    - path: ^/a/\n",
        )
        .unwrap();
        assert!(PathsFactory.new_plugin(&document.section("paths")).is_err());

        let document = Document::from_yaml_str(
            "paths:\n  routes:\n    - path: ^/a/\n      target-path: /b/\n      target-url: http://x/\n",
        )
        .unwrap();
        assert!(PathsFactory.new_plugin(&document.section("paths")).is_err());
    }

    #[test]
    fn bad_regex_is_a_startup_error() {
        let document =
            Document::from_yaml_str("paths:\n  routes:\n    - path: '['\n      target-path: /b/\n")
                .unwrap();
        let error = PathsFactory
            .new_plugin(&document.section("paths"))
            .unwrap_err();
        assert!(error.to_string().contains("regular expression"));
    }

    #[tokio::test]
    async fn path_rules_rewrite_only_the_path() {
        let plugin =
            plugin("paths:\n  routes:\n    - path: ^/foo/\n      target-path: /xyz/\n").unwrap();
        let uri = rewritten(plugin.as_ref(), "http://target/foo/bar?x=1").await;
        assert_eq!(uri.path(), "/xyz/bar");
        assert_eq!(uri.query(), Some("x=1"));
        assert_eq!(uri.authority().unwrap().as_str(), "target");
    }

    #[tokio::test]
    async fn path_rules_apply_cumulatively_in_order() {
        let plugin = plugin(
            "paths:\n  routes:\n    - path: ^/foo/\n      target-path: /bar/\n    - path: ^/bar/\n      target-path: /baz/\n",
        )
        .unwrap();
        let uri = rewritten(plugin.as_ref(), "http://target/foo/x").await;
        assert_eq!(uri.path(), "/baz/x");
    }

    #[tokio::test]
    async fn path_rules_support_capture_groups() {
        let plugin = plugin(
            "paths:\n  routes:\n    - path: ^/v([0-9]+)/\n      target-path: /api/v$1/\n",
        )
        .unwrap();
        let uri = rewritten(plugin.as_ref(), "http://target/v2/users").await;
        assert_eq!(uri.path(), "/api/v2/users");
    }

    #[tokio::test]
    async fn url_rules_replace_the_target() {
        let plugin = plugin(
            "paths:\n  routes:\n    - path: ^/special/\n      target-url: https://other.example.com:8443/inner/\n",
        )
        .unwrap();

        let mut request = Request::builder()
            .uri("http://target/special/?q=1")
            .body(Body::empty())
            .unwrap();
        assert!(plugin.handle_request(&mut request, &info()).await.is_none());

        let uri = request.uri();
        assert_eq!(uri.scheme_str(), Some("https"));
        assert_eq!(uri.authority().unwrap().as_str(), "other.example.com:8443");
        assert_eq!(uri.path(), "/inner/");
        assert_eq!(uri.query(), Some("q=1"));
        assert_eq!(
            request.headers().get(HOST).unwrap(),
            "other.example.com:8443"
        );
    }

    #[tokio::test]
    async fn url_rules_skip_non_matching_paths() {
        let plugin = plugin(
            "paths:\n  routes:\n    - path: ^/special/\n      target-url: https://other.example.com/\n",
        )
        .unwrap();
        let uri = rewritten(plugin.as_ref(), "http://target/plain").await;
        assert_eq!(uri.authority().unwrap().as_str(), "target");
        assert_eq!(uri.path(), "/plain");
    }

    #[tokio::test]
    async fn legacy_match_and_replacement_keys_work() {
        let plugin = plugin(
            "paths:\n  TRAFFIC_PATHS_MATCH: ^/foo/\n  TRAFFIC_PATHS_REPLACEMENT: /xyz/\n",
        )
        .unwrap();
        let uri = rewritten(plugin.as_ref(), "http://target/foo/bar?x=1").await;
        assert_eq!(uri.path(), "/xyz/bar");
        assert_eq!(uri.query(), Some("x=1"));
    }

    #[test]
    fn legacy_replacement_without_match_is_an_error() {
        let document =
            Document::from_yaml_str("paths:\n  TRAFFIC_PATHS_REPLACEMENT: /xyz/\n").unwrap();
        assert!(matches!(
            PathsFactory.new_plugin(&document.section("paths")),
            Err(ConfigError::MissingOption { .. })
        ));
    }

    #[tokio::test]
    async fn legacy_specials_build_url_rules() {
        let plugin = plugin(
            "paths:\n  TRAFFIC_RELAY_SPECIALS: ^/one/ http://one.example.com/ ^/two/ http://two.example.com/\n",
        )
        .unwrap();
        let uri = rewritten(plugin.as_ref(), "http://target/two/").await;
        assert_eq!(uri.authority().unwrap().as_str(), "two.example.com");
    }

    #[test]
    fn legacy_specials_need_an_even_token_count() {
        let document = Document::from_yaml_str(
            "paths:\n  TRAFFIC_RELAY_SPECIALS: ^/one/ http://one.example.com/ ^/dangling/\n",
        )
        .unwrap();
        let error = PathsFactory
            .new_plugin(&document.section("paths"))
            .unwrap_err();
        assert!(error.to_string().contains("last key has no value"));
    }
}
