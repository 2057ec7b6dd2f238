use std::env;
use std::net::{AddrParseError, SocketAddr};

use thiserror::Error;

const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_GATEWAY_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_INVOICE_EXPIRY_SECONDS: u64 = 1_204_800;
const DEFAULT_LABEL_PREFIX: &str = "inv-espera-";
const DEFAULT_WITHDRAW_DESCRIPTION: &str = "lnurl-bridge withdraw";
const DEFAULT_DEPOSIT_PROVIDER_URL: &str = "https://api.golightning.club/new";
const DEFAULT_SESSION_TTL_SECONDS: u64 = 86_400;
const DEFAULT_SESSION_SWEEP_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayBackend {
    Spark,
    Mock,
}

impl GatewayBackend {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "spark" => Some(Self::Spark),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Spark => "spark",
            Self::Mock => "mock",
        }
    }
}

/// Command-line values that take precedence over the environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigOverrides {
    pub bind_addr: Option<SocketAddr>,
    pub gateway_backend: Option<GatewayBackend>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub service_url: String,
    pub log_filter: String,
    pub log_json: bool,
    pub gateway_backend: GatewayBackend,
    pub spark_url: Option<String>,
    pub spark_token: Option<String>,
    pub spark_accept_invalid_certs: bool,
    pub gateway_timeout_seconds: u64,
    pub invoice_expiry_seconds: u64,
    pub label_prefix: String,
    pub withdraw_description: String,
    pub deposit_provider_url: String,
    pub session_ttl_seconds: u64,
    pub session_sweep_interval_seconds: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid BRIDGE_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: AddrParseError,
    },
    #[error("invalid {name} value '{value}': expected an unsigned integer")]
    InvalidNumber { name: &'static str, value: String },
    #[error("invalid {name} value '{value}': expected true or false")]
    InvalidBool { name: &'static str, value: String },
    #[error("invalid BRIDGE_GATEWAY value '{0}': expected spark or mock")]
    InvalidGatewayBackend(String),
    #[error("invalid SERVICE_URL value '{0}': expected an http(s) URL")]
    InvalidServiceUrl(String),
}

impl Config {
    pub fn from_env(overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let bind_addr = match (overrides.bind_addr, env_string("BRIDGE_BIND_ADDR")) {
            (Some(bind_addr), _) => bind_addr,
            (None, Some(value)) => parse_bind_addr(value)?,
            (None, None) => {
                let port = env_string("PORT").ok_or(ConfigError::Missing("PORT"))?;
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidNumber {
                        name: "PORT",
                        value: port.clone(),
                    })?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
        };

        let service_url = normalize_service_url(
            env_string("SERVICE_URL").ok_or(ConfigError::Missing("SERVICE_URL"))?,
        )?;

        let gateway_backend = match (overrides.gateway_backend, env_string("BRIDGE_GATEWAY")) {
            (Some(backend), _) => backend,
            (None, Some(value)) => {
                GatewayBackend::parse(&value).ok_or(ConfigError::InvalidGatewayBackend(value))?
            }
            (None, None) => GatewayBackend::Spark,
        };

        let config = Self {
            bind_addr,
            service_url,
            log_filter: env_string("BRIDGE_LOG_FILTER")
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            log_json: env_bool("BRIDGE_LOG_JSON", false)?,
            gateway_backend,
            spark_url: env_string("SPARK_URL").map(|value| value.trim_end_matches('/').to_string()),
            spark_token: env_string("SPARK_TOKEN"),
            spark_accept_invalid_certs: env_bool("SPARK_ACCEPT_INVALID_CERTS", true)?,
            gateway_timeout_seconds: env_u64(
                "BRIDGE_GATEWAY_TIMEOUT_SECONDS",
                DEFAULT_GATEWAY_TIMEOUT_SECONDS,
            )?,
            invoice_expiry_seconds: env_u64(
                "BRIDGE_INVOICE_EXPIRY_SECONDS",
                DEFAULT_INVOICE_EXPIRY_SECONDS,
            )?,
            label_prefix: env_string("BRIDGE_LABEL_PREFIX")
                .unwrap_or_else(|| DEFAULT_LABEL_PREFIX.to_string()),
            withdraw_description: env_string("BRIDGE_WITHDRAW_DESCRIPTION")
                .unwrap_or_else(|| DEFAULT_WITHDRAW_DESCRIPTION.to_string()),
            deposit_provider_url: env_string("BRIDGE_DEPOSIT_PROVIDER_URL")
                .unwrap_or_else(|| DEFAULT_DEPOSIT_PROVIDER_URL.to_string()),
            session_ttl_seconds: env_u64("BRIDGE_SESSION_TTL_SECONDS", DEFAULT_SESSION_TTL_SECONDS)?,
            session_sweep_interval_seconds: env_u64(
                "BRIDGE_SESSION_SWEEP_SECONDS",
                DEFAULT_SESSION_SWEEP_SECONDS,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that the selected gateway backend has everything it needs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway_backend == GatewayBackend::Spark {
            if self.spark_url.is_none() {
                return Err(ConfigError::Missing("SPARK_URL"));
            }
            if self.spark_token.is_none() {
                return Err(ConfigError::Missing("SPARK_TOKEN"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl Config {
    #[must_use]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            service_url: "https://bridge.test".to_string(),
            log_filter: "debug".to_string(),
            log_json: false,
            gateway_backend: GatewayBackend::Mock,
            spark_url: None,
            spark_token: None,
            spark_accept_invalid_certs: false,
            gateway_timeout_seconds: 5,
            invoice_expiry_seconds: DEFAULT_INVOICE_EXPIRY_SECONDS,
            label_prefix: DEFAULT_LABEL_PREFIX.to_string(),
            withdraw_description: DEFAULT_WITHDRAW_DESCRIPTION.to_string(),
            deposit_provider_url: DEFAULT_DEPOSIT_PROVIDER_URL.to_string(),
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            session_sweep_interval_seconds: DEFAULT_SESSION_SWEEP_SECONDS,
        }
    }
}

pub(crate) fn parse_bind_addr(value: String) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|source| ConfigError::InvalidBindAddr { value, source })
}

fn normalize_service_url(raw: String) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
        return Err(ConfigError::InvalidServiceUrl(raw));
    }
    Ok(trimmed.to_string())
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let Some(value) = env_string(name) else {
        return Ok(default);
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber { name, value })
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = env_string(name) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool { name, value }),
    }
}
