use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use openagents_lnurl::LnurlError;

use crate::deposit_provider::DepositProviderError;
use crate::gateway::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("invalid payment request: {0}")]
    InvalidPaymentRequest(String),
    #[error("amount mismatch: expected {expected_msat} msat, received {received_msat} msat")]
    AmountMismatch {
        expected_msat: u64,
        received_msat: u64,
    },
    #[error("withdrawal already in progress")]
    DuplicateWithdrawal,
    #[error("{0}")]
    Usage(String),
    #[error("deposit provider unavailable: {0}")]
    DepositUnavailable(String),
}

impl BridgeError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSignature(_) => "invalid_signature",
            Self::GatewayUnavailable(_) => "gateway_unavailable",
            Self::InvalidPaymentRequest(_) => "invalid_payment_request",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::DuplicateWithdrawal => "duplicate_withdrawal",
            Self::Usage(_) => "usage",
            Self::DepositUnavailable(_) => "deposit_unavailable",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Usage(_) => StatusCode::BAD_REQUEST,
            Self::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            Self::DuplicateWithdrawal => StatusCode::CONFLICT,
            Self::InvalidPaymentRequest(_) | Self::AmountMismatch { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::GatewayUnavailable(_) | Self::DepositUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<GatewayError> for BridgeError {
    fn from(error: GatewayError) -> Self {
        Self::GatewayUnavailable(error.to_string())
    }
}

impl From<DepositProviderError> for BridgeError {
    fn from(error: DepositProviderError) -> Self {
        Self::DepositUnavailable(error.to_string())
    }
}

impl From<LnurlError> for BridgeError {
    fn from(error: LnurlError) -> Self {
        match error {
            LnurlError::Encode(_) | LnurlError::Decode(_) => Self::Usage(error.to_string()),
            _ => Self::InvalidSignature(error.to_string()),
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(serde_json::json!({
                "status": "ERROR",
                "reason": self.to_string(),
            })),
        )
            .into_response()
    }
}
