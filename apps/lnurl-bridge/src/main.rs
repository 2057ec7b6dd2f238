use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use openagents_lnurl_bridge::config::{Config, ConfigOverrides, GatewayBackend};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "LNURL-auth login and LNURL-withdraw bridge")]
struct Args {
    /// Socket address to listen on. Overrides BRIDGE_BIND_ADDR and PORT.
    #[arg(long)]
    bind_addr: Option<SocketAddr>,

    /// Payment gateway backend. Overrides BRIDGE_GATEWAY.
    #[arg(long, value_parser = parse_gateway)]
    gateway: Option<GatewayBackend>,
}

fn parse_gateway(raw: &str) -> Result<GatewayBackend, String> {
    GatewayBackend::parse(raw).ok_or_else(|| format!("expected spark or mock, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env(ConfigOverrides {
        bind_addr: args.bind_addr,
        gateway_backend: args.gateway,
    })?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter.as_str()));
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    openagents_lnurl_bridge::serve(config).await
}
