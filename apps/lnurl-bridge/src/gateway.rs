use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use openagents_lnurl::Bolt11;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::{Config, GatewayBackend};
use crate::spark_rpc::SparkGateway;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Rpc { .. } => "rpc",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Unavailable(_) => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Unpaid,
    Paid,
    Expired,
}

impl InvoiceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Paid => "paid",
            Self::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "unpaid" => Some(Self::Unpaid),
            "paid" => Some(Self::Paid),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRequest {
    pub amount_msat: u64,
    pub label: String,
    pub description: String,
    pub expiry_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRecord {
    pub label: String,
    pub bolt11: String,
    pub amount_msat: u64,
    pub status: InvoiceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPaymentRequest {
    pub amount_msat: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PaymentReceipt {
    pub payment_preimage: Option<String>,
}

/// Remote Lightning node operations the bridge depends on.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn create_invoice(&self, request: InvoiceRequest) -> Result<InvoiceRecord, GatewayError>;

    /// Most recent invoice registered under `label`, if any.
    async fn find_invoice(&self, label: &str) -> Result<Option<InvoiceRecord>, GatewayError>;

    async fn decode_payment_request(
        &self,
        bolt11: &str,
    ) -> Result<DecodedPaymentRequest, GatewayError>;

    async fn wait_pay(&self, bolt11: &str) -> Result<PaymentReceipt, GatewayError>;

    /// Delete the invoice under `label`; the node rejects it unless `status` matches.
    async fn delete_invoice(&self, label: &str, status: InvoiceStatus) -> Result<(), GatewayError>;
}

/// Build the process-wide gateway for the configured backend.
pub fn build_gateway(config: &Config) -> Arc<dyn PaymentGateway> {
    match config.gateway_backend {
        GatewayBackend::Mock => Arc::new(MockPaymentGateway::new().with_auto_settle()),
        GatewayBackend::Spark => {
            let (Some(url), Some(token)) = (config.spark_url.clone(), config.spark_token.clone())
            else {
                return Arc::new(UnavailableGateway::new(
                    "spark",
                    "SPARK_URL and SPARK_TOKEN are required when BRIDGE_GATEWAY=spark",
                ));
            };
            match SparkGateway::new(
                url,
                token,
                config.gateway_timeout_seconds,
                config.spark_accept_invalid_certs,
            ) {
                Ok(gateway) => Arc::new(gateway),
                Err(error) => {
                    tracing::warn!(
                        target: "lnurl_bridge.gateway",
                        error = %error,
                        "failed to build spark client"
                    );
                    Arc::new(UnavailableGateway::new("spark", error.to_string()))
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnavailableGateway {
    backend: &'static str,
    reason: String,
}

impl UnavailableGateway {
    pub fn new(backend: &'static str, reason: impl Into<String>) -> Self {
        Self {
            backend,
            reason: reason.into(),
        }
    }

    fn error(&self) -> GatewayError {
        GatewayError::Unavailable(self.reason.clone())
    }
}

#[async_trait]
impl PaymentGateway for UnavailableGateway {
    fn backend(&self) -> &'static str {
        self.backend
    }

    async fn create_invoice(&self, _request: InvoiceRequest) -> Result<InvoiceRecord, GatewayError> {
        Err(self.error())
    }

    async fn find_invoice(&self, _label: &str) -> Result<Option<InvoiceRecord>, GatewayError> {
        Err(self.error())
    }

    async fn decode_payment_request(
        &self,
        _bolt11: &str,
    ) -> Result<DecodedPaymentRequest, GatewayError> {
        Err(self.error())
    }

    async fn wait_pay(&self, _bolt11: &str) -> Result<PaymentReceipt, GatewayError> {
        Err(self.error())
    }

    async fn delete_invoice(
        &self,
        _label: &str,
        _status: InvoiceStatus,
    ) -> Result<(), GatewayError> {
        Err(self.error())
    }
}

// bech32 data charset, which never contains '1'.
const MOCK_SUFFIX_CHARSET: &[u8] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Build a regtest-style payment request carrying `amount_msat`.
pub fn mock_payment_request(amount_msat: u64, nonce: u64) -> Option<String> {
    let pico = amount_msat.checked_mul(10)?;
    let mut suffix = String::from("mock");
    let mut value = nonce;
    loop {
        let index = usize::try_from(value % 32).ok()?;
        suffix.push(char::from(*MOCK_SUFFIX_CHARSET.get(index)?));
        value /= 32;
        if value == 0 {
            break;
        }
    }
    Some(format!("lnbcrt{pico}p1{suffix}"))
}

#[derive(Debug, Default)]
struct MockState {
    invoices: HashMap<String, InvoiceRecord>,
    paid_requests: Vec<String>,
    sequence: u64,
    unavailable: Option<String>,
    pay_failure: Option<String>,
}

/// In-memory gateway for local runs and tests.
#[derive(Debug)]
pub struct MockPaymentGateway {
    state: Mutex<MockState>,
    payments_open: watch::Sender<bool>,
    auto_settle: bool,
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPaymentGateway {
    #[must_use]
    pub fn new() -> Self {
        let (payments_open, _) = watch::channel(true);
        Self {
            state: Mutex::new(MockState::default()),
            payments_open,
            auto_settle: false,
        }
    }

    /// Treat every created invoice as immediately paid.
    #[must_use]
    pub fn with_auto_settle(mut self) -> Self {
        self.auto_settle = true;
        self
    }

    pub fn insert_invoice(&self, label: &str, amount_msat: u64, status: InvoiceStatus) {
        let mut state = self.state();
        state.sequence += 1;
        let bolt11 = mock_payment_request(amount_msat, state.sequence).unwrap_or_default();
        state.invoices.insert(
            label.to_string(),
            InvoiceRecord {
                label: label.to_string(),
                bolt11,
                amount_msat,
                status,
            },
        );
    }

    pub fn mark_paid(&self, label: &str) -> bool {
        match self.state().invoices.get_mut(label) {
            Some(invoice) => {
                invoice.status = InvoiceStatus::Paid;
                true
            }
            None => false,
        }
    }

    /// Fail every call with a transport error until cleared with `None`.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state().unavailable = reason.map(str::to_string);
    }

    pub fn fail_payments(&self, reason: Option<&str>) {
        self.state().pay_failure = reason.map(str::to_string);
    }

    /// Block `wait_pay` until `release_payments` is called.
    pub fn hold_payments(&self) {
        self.payments_open.send_replace(false);
    }

    pub fn release_payments(&self) {
        self.payments_open.send_replace(true);
    }

    #[must_use]
    pub fn paid_requests(&self) -> Vec<String> {
        self.state().paid_requests.clone()
    }

    #[must_use]
    pub fn invoice(&self, label: &str) -> Option<InvoiceRecord> {
        self.state().invoices.get(label).cloned()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), GatewayError> {
        match self.state().unavailable.clone() {
            Some(reason) => Err(GatewayError::Transport(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    fn backend(&self) -> &'static str {
        "mock"
    }

    async fn create_invoice(&self, request: InvoiceRequest) -> Result<InvoiceRecord, GatewayError> {
        self.check_available()?;
        let mut state = self.state();
        if state.invoices.contains_key(&request.label) {
            return Err(GatewayError::Rpc {
                code: 900,
                message: format!("duplicate label '{}'", request.label),
            });
        }
        state.sequence += 1;
        let bolt11 =
            mock_payment_request(request.amount_msat, state.sequence).ok_or_else(|| {
                GatewayError::Rpc {
                    code: -32602,
                    message: "amount out of range".to_string(),
                }
            })?;
        let status = if self.auto_settle {
            InvoiceStatus::Paid
        } else {
            InvoiceStatus::Unpaid
        };
        let record = InvoiceRecord {
            label: request.label.clone(),
            bolt11,
            amount_msat: request.amount_msat,
            status,
        };
        state.invoices.insert(request.label, record.clone());
        Ok(record)
    }

    async fn find_invoice(&self, label: &str) -> Result<Option<InvoiceRecord>, GatewayError> {
        self.check_available()?;
        Ok(self.state().invoices.get(label).cloned())
    }

    async fn decode_payment_request(
        &self,
        bolt11: &str,
    ) -> Result<DecodedPaymentRequest, GatewayError> {
        self.check_available()?;
        if !bolt11.trim().to_ascii_lowercase().starts_with("ln") {
            return Err(GatewayError::Rpc {
                code: -32602,
                message: "invalid bolt11 string".to_string(),
            });
        }
        Ok(DecodedPaymentRequest {
            amount_msat: Bolt11::amount_msats(bolt11),
        })
    }

    async fn wait_pay(&self, bolt11: &str) -> Result<PaymentReceipt, GatewayError> {
        self.check_available()?;
        let mut open = self.payments_open.subscribe();
        open.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|error| GatewayError::Transport(error.to_string()))?;

        let mut state = self.state();
        state.paid_requests.push(bolt11.to_string());
        match state.pay_failure.clone() {
            Some(reason) => Err(GatewayError::Rpc {
                code: 205,
                message: reason,
            }),
            None => Ok(PaymentReceipt {
                payment_preimage: Some(format!("{:064x}", state.paid_requests.len())),
            }),
        }
    }

    async fn delete_invoice(&self, label: &str, status: InvoiceStatus) -> Result<(), GatewayError> {
        self.check_available()?;
        let mut state = self.state();
        let Some(existing) = state.invoices.get(label) else {
            return Err(GatewayError::Rpc {
                code: 905,
                message: format!("unknown invoice '{label}'"),
            });
        };
        if existing.status != status {
            return Err(GatewayError::Rpc {
                code: 905,
                message: format!(
                    "invoice status is {} not {}",
                    existing.status.as_str(),
                    status.as_str()
                ),
            });
        }
        state.invoices.remove(label);
        Ok(())
    }
}
