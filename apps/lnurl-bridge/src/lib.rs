#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    config::{Config, GatewayBackend},
    deposit_provider::{DepositAddressProvider, GoLightningClubProvider, StaticDepositProvider},
    gateway::build_gateway,
    server::{AppState, build_router},
};

pub mod auth_flow;
pub mod config;
pub mod deposit_flow;
pub mod deposit_provider;
pub mod error;
pub mod gateway;
pub mod notifications;
pub mod server;
pub mod sessions;
pub mod spark_rpc;
pub mod withdraw_flow;
pub mod withdraw_lock;

const MOCK_DEPOSIT_ADDRESS: &str = "bcrt1qmockdepositaddress";

pub fn build_deposit_provider(config: &Config) -> Result<Arc<dyn DepositAddressProvider>> {
    let provider: Arc<dyn DepositAddressProvider> = match config.gateway_backend {
        GatewayBackend::Mock => Arc::new(StaticDepositProvider::new(MOCK_DEPOSIT_ADDRESS, "0")),
        GatewayBackend::Spark => Arc::new(GoLightningClubProvider::new(
            config.deposit_provider_url.clone(),
            config.gateway_timeout_seconds,
        )?),
    };
    Ok(provider)
}

pub fn build_state(config: &Config) -> Result<AppState> {
    let gateway = build_gateway(config);
    let provider = build_deposit_provider(config)?;
    Ok(AppState::new(config, gateway, provider))
}

fn spawn_sweeper(state: AppState, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            state.sweep();
        }
    });
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    let state = build_state(&config)?;
    spawn_sweeper(
        state.clone(),
        Duration::from_secs(config.session_sweep_interval_seconds.max(1)),
    );
    info!(
        service_url = %config.service_url,
        bind_addr = %listener.local_addr()?,
        gateway = config.gateway_backend.as_str(),
        "lnurl bridge listening"
    );
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %error, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
