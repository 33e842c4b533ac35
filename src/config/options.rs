//! Options for the relay service and the core forwarding engine, read from
//! the `relay` section of the configuration document.

use url::Url;

use crate::config::{ConfigError, Document, Section};

/// Maximum length in bytes of relayed bodies, unless configured otherwise.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 2048; // 2MB

/// Options for the network service.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// The port the relay service listens on.
    pub port: u16,
}

/// Options for the core relay engine.
///
/// It's preferable to keep the core relay code simple; before adding a new
/// option here, consider whether the same functionality could live in a
/// plugin.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// The scheme ("http" or "https") used to reach the target host.
    pub target_scheme: String,
    /// The host to relay traffic to (e.g. `192.168.0.1:1234`).
    pub target_host: String,
    /// Maximum length in bytes of relayed bodies.
    pub max_body_size: u64,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub service: ServiceOptions,
    pub relay: RelayOptions,
}

/// Reads service and relay options from the `relay` section.
///
/// `target` and `max-body-size` also accept their historical environment
/// variable names (`TRAFFIC_RELAY_TARGET`, `TRAFFIC_RELAY_MAX_BODY_SIZE`)
/// as section keys, so configurations predating the YAML format keep
/// working.
pub fn read_options(document: &Document) -> Result<Options, ConfigError> {
    let section = document.required_section("relay")?;

    let port = section.lookup_required::<u16>("port")?;

    let target = match section.lookup_optional::<String>("target")? {
        Some(target) => target,
        None => section
            .lookup_optional::<String>("TRAFFIC_RELAY_TARGET")?
            .ok_or_else(|| ConfigError::MissingOption {
                section: section.name().to_string(),
                key: "target".to_string(),
            })?,
    };
    let (target_scheme, target_host) = parse_target(section, &target)?;

    let max_body_size = match section.lookup_optional::<u64>("max-body-size")? {
        Some(size) => size,
        None => section
            .lookup_optional::<u64>("TRAFFIC_RELAY_MAX_BODY_SIZE")?
            .unwrap_or(DEFAULT_MAX_BODY_SIZE),
    };

    tracing::info!(port, target = %target, max_body_size, "relay options loaded");

    Ok(Options {
        service: ServiceOptions { port },
        relay: RelayOptions {
            target_scheme,
            target_host,
            max_body_size,
        },
    })
}

/// Splits a target URL into scheme and `host[:port]`. The URL must be
/// absolute with an http or https scheme.
fn parse_target(section: &Section, target: &str) -> Result<(String, String), ConfigError> {
    let parse_error = |message: String| ConfigError::ParseOption {
        section: section.name().to_string(),
        key: "target".to_string(),
        message,
    };

    let url = Url::parse(target).map_err(|e| parse_error(format!("\"{target}\": {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(parse_error(format!(
                "\"{target}\": unsupported scheme \"{other}\""
            )))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| parse_error(format!("\"{target}\": invalid or relative target URL")))?;

    let target_host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    Ok((url.scheme().to_string(), target_host))
}
