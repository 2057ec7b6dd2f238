use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};

use crate::gateway::{
    DecodedPaymentRequest, GatewayError, InvoiceRecord, InvoiceRequest, InvoiceStatus,
    PaymentGateway, PaymentReceipt,
};

const ACCESS_HEADER: &str = "X-Access";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    method: &'a str,
    params: Vec<Value>,
}

/// Lightning node reached through a Spark wallet's `/rpc` endpoint.
#[derive(Debug, Clone)]
pub struct SparkGateway {
    http: reqwest::Client,
    rpc_url: String,
    access_token: String,
}

impl SparkGateway {
    pub fn new(
        base_url: String,
        access_token: String,
        timeout_seconds: u64,
        accept_invalid_certs: bool,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|error| GatewayError::Unavailable(error.to_string()))?;
        Ok(Self {
            http,
            rpc_url: format!("{}/rpc", base_url.trim_end_matches('/')),
            access_token,
        })
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, GatewayError> {
        let response = self
            .http
            .post(&self.rpc_url)
            .header(ACCESS_HEADER, &self.access_token)
            .json(&RpcRequest { method, params })
            .send()
            .await
            .map_err(|error| GatewayError::Transport(format!("{method}: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| GatewayError::Transport(format!("{method}: {error}")))?;

        if !status.is_success() {
            return Err(rpc_error(status.as_u16(), &body));
        }

        serde_json::from_str(&body)
            .map_err(|error| GatewayError::InvalidResponse(format!("{method}: {error}")))
    }
}

#[async_trait]
impl PaymentGateway for SparkGateway {
    fn backend(&self) -> &'static str {
        "spark"
    }

    async fn create_invoice(&self, request: InvoiceRequest) -> Result<InvoiceRecord, GatewayError> {
        let result = self
            .call(
                "invoice",
                vec![
                    json!(request.amount_msat),
                    json!(request.label),
                    json!(request.description),
                    json!(request.expiry_seconds),
                ],
            )
            .await?;
        let bolt11 = result
            .get("bolt11")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::InvalidResponse("invoice: missing bolt11".to_string()))?;
        Ok(InvoiceRecord {
            label: request.label,
            bolt11: bolt11.to_string(),
            amount_msat: request.amount_msat,
            status: InvoiceStatus::Unpaid,
        })
    }

    async fn find_invoice(&self, label: &str) -> Result<Option<InvoiceRecord>, GatewayError> {
        let result = self.call("listinvoices", vec![json!(label)]).await?;
        parse_listinvoices(&result)
    }

    async fn decode_payment_request(
        &self,
        bolt11: &str,
    ) -> Result<DecodedPaymentRequest, GatewayError> {
        let result = self.call("decodepay", vec![json!(bolt11)]).await?;
        Ok(DecodedPaymentRequest {
            amount_msat: amount_msat_field(&result),
        })
    }

    async fn wait_pay(&self, bolt11: &str) -> Result<PaymentReceipt, GatewayError> {
        let result = self.call("waitpay", vec![json!(bolt11)]).await?;
        Ok(PaymentReceipt {
            payment_preimage: result
                .get("payment_preimage")
                .or_else(|| result.get("preimage"))
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    async fn delete_invoice(&self, label: &str, status: InvoiceStatus) -> Result<(), GatewayError> {
        self.call("delinvoice", vec![json!(label), json!(status.as_str())])
            .await
            .map(|_| ())
    }
}

fn rpc_error(http_status: u16, body: &str) -> GatewayError {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|value| value.get("message"))
        .and_then(Value::as_str);
    match message {
        Some(message) => GatewayError::Rpc {
            code: parsed
                .as_ref()
                .and_then(|value| value.get("code"))
                .and_then(Value::as_i64)
                .unwrap_or(i64::from(http_status)),
            message: message.to_string(),
        },
        None => GatewayError::Transport(format!("http {http_status}: {body}")),
    }
}

pub(crate) fn parse_listinvoices(result: &Value) -> Result<Option<InvoiceRecord>, GatewayError> {
    let invoices = result
        .get("invoices")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            GatewayError::InvalidResponse("listinvoices: missing invoices".to_string())
        })?;
    let Some(invoice) = invoices.first() else {
        return Ok(None);
    };

    let status = invoice
        .get("status")
        .and_then(Value::as_str)
        .and_then(InvoiceStatus::parse)
        .ok_or_else(|| GatewayError::InvalidResponse("listinvoices: bad status".to_string()))?;
    let amount_msat = amount_msat_field(invoice)
        .ok_or_else(|| GatewayError::InvalidResponse("listinvoices: missing amount".to_string()))?;

    Ok(Some(InvoiceRecord {
        label: invoice
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        bolt11: invoice
            .get("bolt11")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        amount_msat,
        status,
    }))
}

/// Reads `msatoshi` or `amount_msat`, accepting numbers and `"<n>msat"` strings.
pub(crate) fn amount_msat_field(value: &Value) -> Option<u64> {
    ["amount_msat", "msatoshi"]
        .iter()
        .filter_map(|key| value.get(*key))
        .find_map(|field| match field {
            Value::Number(number) => number.as_u64(),
            Value::String(text) => text.trim().trim_end_matches("msat").parse().ok(),
            _ => None,
        })
}
