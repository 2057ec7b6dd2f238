use std::sync::Arc;

use serde_json::json;

use crate::config::Config;
use crate::deposit_provider::{DepositAddressProvider, DepositQuote};
use crate::error::BridgeError;
use crate::gateway::{InvoiceRequest, InvoiceStatus, PaymentGateway};
use crate::notifications::{BridgeEvent, NotificationHub};
use crate::sessions::SessionRegistry;
use crate::withdraw_flow::invoice_label;

pub struct DepositIntentFlow {
    gateway: Arc<dyn PaymentGateway>,
    provider: Arc<dyn DepositAddressProvider>,
    sessions: Arc<SessionRegistry>,
    notifications: Arc<NotificationHub>,
    label_prefix: String,
    expiry_seconds: u64,
}

impl DepositIntentFlow {
    pub fn new(
        config: &Config,
        gateway: Arc<dyn PaymentGateway>,
        provider: Arc<dyn DepositAddressProvider>,
        sessions: Arc<SessionRegistry>,
        notifications: Arc<NotificationHub>,
    ) -> Self {
        Self {
            gateway,
            provider,
            sessions,
            notifications,
            label_prefix: config.label_prefix.clone(),
            expiry_seconds: config.invoice_expiry_seconds,
        }
    }

    /// Open a deposit intent and fetch an on-chain address for its invoice.
    ///
    /// The quote is pushed to the session as a `btc-deposit` event. Failures
    /// after the session is resolved are pushed as `{"error": reason}`.
    pub async fn issue_deposit_invoice(
        &self,
        session: &str,
        amount_msat: u64,
    ) -> Result<DepositQuote, BridgeError> {
        let pubkey = self
            .sessions
            .lookup_pubkey(session)
            .ok_or_else(|| BridgeError::usage("session is not authenticated"))?;
        if amount_msat == 0 {
            return Err(BridgeError::usage("amount must be positive"));
        }
        let label = invoice_label(&self.label_prefix, &pubkey);

        match self.request_quote(&label, amount_msat).await {
            Ok(quote) => {
                tracing::info!(
                    target: "lnurl_bridge.deposit",
                    session,
                    pubkey = %pubkey,
                    amount_msat,
                    provider = self.provider.name(),
                    "deposit address issued"
                );
                self.notifications.publish(
                    session,
                    BridgeEvent::btc_deposit(json!({
                        "address": quote.address,
                        "price": quote.price,
                    })),
                );
                Ok(quote)
            }
            Err(error) => {
                tracing::error!(
                    target: "lnurl_bridge.deposit",
                    session,
                    pubkey = %pubkey,
                    amount_msat,
                    error = %error,
                    "deposit intent failed"
                );
                self.notifications.publish(
                    session,
                    BridgeEvent::btc_deposit(json!({ "error": error.to_string() })),
                );
                Err(error)
            }
        }
    }

    async fn request_quote(
        &self,
        label: &str,
        amount_msat: u64,
    ) -> Result<DepositQuote, BridgeError> {
        let existing = self.gateway.find_invoice(label).await?;
        if existing.is_some_and(|invoice| invoice.status == InvoiceStatus::Expired) {
            self.gateway
                .delete_invoice(label, InvoiceStatus::Expired)
                .await?;
        }

        let invoice = self
            .gateway
            .create_invoice(InvoiceRequest {
                amount_msat,
                label: label.to_string(),
                description: label.to_string(),
                expiry_seconds: self.expiry_seconds,
            })
            .await?;
        Ok(self.provider.request_address(&invoice.bolt11).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::DepositIntentFlow;
    use crate::config::Config;
    use crate::deposit_provider::{
        DepositAddressProvider, DepositProviderError, StaticDepositProvider,
    };
    use crate::error::BridgeError;
    use crate::gateway::{InvoiceStatus, MockPaymentGateway, PaymentGateway};
    use crate::notifications::{BridgeEvent, NotificationHub};
    use crate::sessions::SessionRegistry;

    struct Harness {
        gateway: Arc<MockPaymentGateway>,
        provider: Arc<StaticDepositProvider>,
        notifications: Arc<NotificationHub>,
        flow: DepositIntentFlow,
        session: String,
    }

    fn harness(provider: StaticDepositProvider) -> anyhow::Result<Harness> {
        let config = Config::for_tests();
        let gateway = Arc::new(MockPaymentGateway::new());
        let provider = Arc::new(provider);
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let notifications = Arc::new(NotificationHub::default());
        let session = sessions.create_session();
        sessions.bind_pubkey(&session, "02aa")?;
        let flow = DepositIntentFlow::new(
            &config,
            Arc::clone(&gateway) as Arc<dyn PaymentGateway>,
            Arc::clone(&provider) as Arc<dyn DepositAddressProvider>,
            sessions,
            Arc::clone(&notifications),
        );
        Ok(Harness {
            gateway,
            provider,
            notifications,
            flow,
            session,
        })
    }

    #[tokio::test]
    async fn deposit_creates_invoice_and_pushes_quote() -> anyhow::Result<()> {
        let harness = harness(StaticDepositProvider::new("bc1qexample", "64000"))?;
        let mut events = harness.notifications.subscribe(&harness.session);

        let quote = harness
            .flow
            .issue_deposit_invoice(&harness.session, 21_000)
            .await?;
        assert_eq!(quote.address, "bc1qexample");

        let invoice = harness
            .gateway
            .invoice("inv-espera-02aa")
            .ok_or_else(|| anyhow::anyhow!("invoice was not created"))?;
        assert_eq!(invoice.amount_msat, 21_000);
        assert_eq!(invoice.status, InvoiceStatus::Unpaid);
        assert_eq!(harness.provider.requests(), vec![invoice.bolt11]);
        assert_eq!(
            events.recv().await,
            Some(BridgeEvent::btc_deposit(
                json!({"address": "bc1qexample", "price": "64000"})
            ))
        );
        Ok(())
    }

    #[tokio::test]
    async fn provider_failure_is_pushed_and_returned() -> anyhow::Result<()> {
        let harness = harness(StaticDepositProvider::failing(
            DepositProviderError::Rejected("amount too small".to_string()),
        ))?;
        let mut events = harness.notifications.subscribe(&harness.session);

        let result = harness
            .flow
            .issue_deposit_invoice(&harness.session, 21_000)
            .await;
        assert!(matches!(result, Err(BridgeError::DepositUnavailable(_))));

        let event = events
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("missing btc-deposit event"))?;
        assert!(event.data["error"].as_str().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn expired_invoice_is_replaced() -> anyhow::Result<()> {
        let harness = harness(StaticDepositProvider::new("bc1qexample", "64000"))?;
        harness
            .gateway
            .insert_invoice("inv-espera-02aa", 5_000, InvoiceStatus::Expired);

        harness
            .flow
            .issue_deposit_invoice(&harness.session, 21_000)
            .await?;
        assert_eq!(
            harness
                .gateway
                .invoice("inv-espera-02aa")
                .map(|invoice| invoice.amount_msat),
            Some(21_000)
        );
        Ok(())
    }

    #[tokio::test]
    async fn deposit_requires_bound_session_and_positive_amount() -> anyhow::Result<()> {
        let harness = harness(StaticDepositProvider::new("bc1qexample", "64000"))?;
        assert!(matches!(
            harness.flow.issue_deposit_invoice("unknown", 21_000).await,
            Err(BridgeError::Usage(_))
        ));
        assert!(matches!(
            harness.flow.issue_deposit_invoice(&harness.session, 0).await,
            Err(BridgeError::Usage(_))
        ));
        assert!(harness.provider.requests().is_empty());
        Ok(())
    }
}
