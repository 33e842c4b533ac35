use std::io::Read;
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use traffic_relay::config::{read_options, Document};
use traffic_relay::env::{substitute_vars, DefaultProvider};
use traffic_relay::plugin::{default_factories, load};
use traffic_relay::relay::RelayEngine;
use traffic_relay::service::{KeepAliveListener, RelayService};

/// First-party traffic relay.
#[derive(Parser)]
#[command(name = "traffic-relay")]
struct Args {
    /// Configuration file path; use '-' to read from standard input. A
    /// default relay.yaml is distributed with the relay, so configurations
    /// based purely on environment variables need no explicit file.
    #[arg(long, default_value = "relay.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "traffic_relay=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "relay failed to start");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let raw_config = read_config_file(&args.config)
        .map_err(|e| format!("couldn't read configuration file \"{}\": {e}", args.config))?;

    // Substitute environment variables into the configuration file. In
    // versions of the relay predating the YAML format, configuration was
    // performed entirely via environment variables; substitution keeps
    // those configurations working.
    let provider = DefaultProvider::new();
    let config_source = substitute_vars(&provider, &raw_config);

    let document = Document::from_yaml_str(&config_source)?;
    let options = read_options(&document)?;

    let plugins = load(&default_factories(), &document)?;
    tracing::info!("active plugins:");
    for plugin in &plugins {
        tracing::info!(plugin = plugin.name(), "  traffic");
    }

    let engine = RelayEngine::new(&options.relay)?;
    let service = RelayService::new(engine, plugins);

    let address = SocketAddr::from(([0, 0, 0, 0], options.service.port));
    let listener = KeepAliveListener::bind(address).await?;

    service.serve(listener).await?;
    Ok(())
}

fn read_config_file(path: &str) -> std::io::Result<String> {
    if path == "-" {
        let mut contents = String::new();
        std::io::stdin().read_to_string(&mut contents)?;
        return Ok(contents);
    }

    std::fs::read_to_string(path)
}
