use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DepositProviderError {
    #[error("deposit provider request failed: {0}")]
    Transport(String),
    #[error("deposit provider returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("deposit provider response is invalid: {0}")]
    InvalidResponse(String),
    #[error("deposit provider rejected the invoice: {0}")]
    Rejected(String),
}

/// On-chain address and quote returned for a Lightning invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositQuote {
    pub address: String,
    pub price: String,
}

#[async_trait]
pub trait DepositAddressProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn request_address(&self, bolt11: &str) -> Result<DepositQuote, DepositProviderError>;
}

#[derive(Debug, Deserialize)]
struct GoLightningResponse {
    #[serde(rename = "bitcoinAddress", default)]
    bitcoin_address: String,
    #[serde(rename = "btcPrice", default)]
    btc_price: serde_json::Value,
    #[serde(default)]
    error: String,
}

/// golightning.club style provider: form POST of `bolt11`, JSON reply.
#[derive(Debug, Clone)]
pub struct GoLightningClubProvider {
    http: reqwest::Client,
    endpoint: String,
}

impl GoLightningClubProvider {
    pub fn new(endpoint: String, timeout_seconds: u64) -> Result<Self, DepositProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|error| DepositProviderError::Transport(error.to_string()))?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl DepositAddressProvider for GoLightningClubProvider {
    fn name(&self) -> &'static str {
        "golightning"
    }

    async fn request_address(&self, bolt11: &str) -> Result<DepositQuote, DepositProviderError> {
        let response = self
            .http
            .post(&self.endpoint)
            .form(&[("bolt11", bolt11)])
            .send()
            .await
            .map_err(|error| DepositProviderError::Transport(error.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| DepositProviderError::Transport(error.to_string()))?;
        if !status.is_success() {
            return Err(DepositProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_response(&body)
    }
}

fn parse_response(body: &str) -> Result<DepositQuote, DepositProviderError> {
    let parsed = serde_json::from_str::<GoLightningResponse>(body)
        .map_err(|error| DepositProviderError::InvalidResponse(error.to_string()))?;
    if !parsed.error.is_empty() {
        return Err(DepositProviderError::Rejected(parsed.error));
    }
    if parsed.bitcoin_address.is_empty() {
        return Err(DepositProviderError::InvalidResponse(
            "missing bitcoinAddress".to_string(),
        ));
    }
    let price = match parsed.btc_price {
        serde_json::Value::String(price) => price,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    Ok(DepositQuote {
        address: parsed.bitcoin_address,
        price,
    })
}

/// Fixed-answer provider for local runs and tests.
#[derive(Debug)]
pub struct StaticDepositProvider {
    outcome: Result<DepositQuote, DepositProviderError>,
    requests: Mutex<Vec<String>>,
}

impl StaticDepositProvider {
    #[must_use]
    pub fn new(address: &str, price: &str) -> Self {
        Self {
            outcome: Ok(DepositQuote {
                address: address.to_string(),
                price: price.to_string(),
            }),
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn failing(error: DepositProviderError) -> Self {
        Self {
            outcome: Err(error),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Payment requests this provider has been asked to quote.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DepositAddressProvider for StaticDepositProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn request_address(&self, bolt11: &str) -> Result<DepositQuote, DepositProviderError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(bolt11.to_string());
        }
        self.outcome.clone()
    }
}
