use std::sync::Arc;

use serde::Serialize;

use crate::error::BridgeError;
use crate::notifications::{BridgeEvent, NotificationHub};
use crate::sessions::SessionRegistry;
use crate::withdraw_flow::WithdrawalFlow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginChallenge {
    pub session: String,
    pub lnurl: String,
}

/// LNURL-auth login: challenge issuance and signature verification.
pub struct AuthChallengeFlow {
    service_url: String,
    sessions: Arc<SessionRegistry>,
    notifications: Arc<NotificationHub>,
    withdrawals: Arc<WithdrawalFlow>,
}

impl AuthChallengeFlow {
    pub fn new(
        service_url: String,
        sessions: Arc<SessionRegistry>,
        notifications: Arc<NotificationHub>,
        withdrawals: Arc<WithdrawalFlow>,
    ) -> Self {
        Self {
            service_url,
            sessions,
            notifications,
            withdrawals,
        }
    }

    pub fn issue_challenge(&self) -> Result<LoginChallenge, BridgeError> {
        let session = self.sessions.create_session();
        let url = format!(
            "{}/login-callback?tag=login&k1={session}",
            self.service_url
        );
        let lnurl = openagents_lnurl::encode_lnurl(&url)?;
        Ok(LoginChallenge { session, lnurl })
    }

    /// Verify a wallet's signature over `k1` and bind `key` to that session.
    pub async fn verify_challenge(&self, k1: &str, sig: &str, key: &str) -> Result<(), BridgeError> {
        openagents_lnurl::verify_signature(k1, sig, key).map_err(|error| {
            tracing::warn!(
                target: "lnurl_bridge.auth",
                session = k1,
                error = %error,
                "login signature verification failed"
            );
            BridgeError::InvalidSignature(error.to_string())
        })?;

        let session = k1.trim().to_ascii_lowercase();
        let pubkey = key.trim().to_ascii_lowercase();
        self.sessions.bind_pubkey(&session, &pubkey)?;
        tracing::info!(
            target: "lnurl_bridge.auth",
            session = %session,
            pubkey = %pubkey,
            "session authenticated"
        );

        if !self.notifications.is_connected(&session) {
            return Ok(());
        }
        self.notifications
            .publish(&session, BridgeEvent::login(&pubkey));

        let state = match self.withdrawals.status_query(&pubkey).await {
            Ok(status) => self.withdrawals.withdraw_state(&session, status),
            Err(error) => Err(error),
        };
        match state {
            Ok(state) => {
                self.notifications
                    .publish(&session, BridgeEvent::withdraw(state));
            }
            Err(error) => {
                tracing::error!(
                    target: "lnurl_bridge.auth",
                    session = %session,
                    pubkey = %pubkey,
                    error = %error,
                    "failed to load withdrawal state after login"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::AuthChallengeFlow;
    use crate::config::Config;
    use crate::error::BridgeError;
    use crate::gateway::{InvoiceStatus, MockPaymentGateway, PaymentGateway};
    use crate::notifications::{BridgeEvent, EventKind, NotificationHub};
    use crate::sessions::SessionRegistry;
    use crate::withdraw_flow::WithdrawalFlow;
    use crate::withdraw_flow::tests::TestKey;

    struct Harness {
        gateway: Arc<MockPaymentGateway>,
        sessions: Arc<SessionRegistry>,
        notifications: Arc<NotificationHub>,
        auth: AuthChallengeFlow,
    }

    fn harness() -> Harness {
        let config = Config::for_tests();
        let gateway = Arc::new(MockPaymentGateway::new());
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let notifications = Arc::new(NotificationHub::default());
        let withdrawals = Arc::new(WithdrawalFlow::new(
            &config,
            Arc::clone(&gateway) as Arc<dyn PaymentGateway>,
            Arc::clone(&sessions),
            Arc::clone(&notifications),
        ));
        let auth = AuthChallengeFlow::new(
            config.service_url.clone(),
            Arc::clone(&sessions),
            Arc::clone(&notifications),
            withdrawals,
        );
        Harness {
            gateway,
            sessions,
            notifications,
            auth,
        }
    }

    #[test]
    fn challenges_are_unique_and_leave_no_session_state() -> anyhow::Result<()> {
        let harness = harness();
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let challenge = harness.auth.issue_challenge()?;
            assert!(seen.insert(challenge.session), "duplicate session id");
        }
        assert!(harness.sessions.is_empty());
        Ok(())
    }

    #[test]
    fn challenge_lnurl_points_at_the_login_callback() -> anyhow::Result<()> {
        let harness = harness();
        let challenge = harness.auth.issue_challenge()?;
        let url = openagents_lnurl::decode_lnurl(&challenge.lnurl)?;
        assert_eq!(
            url,
            format!(
                "https://bridge.test/login-callback?tag=login&k1={}",
                challenge.session
            )
        );
        Ok(())
    }

    #[tokio::test]
    async fn valid_signature_binds_and_notifies() -> anyhow::Result<()> {
        let harness = harness();
        let key = TestKey::new(7)?;
        let challenge = harness.auth.issue_challenge()?;
        let label = format!("inv-espera-{}", key.pubkey);
        harness
            .gateway
            .insert_invoice(&label, 21_000, InvoiceStatus::Unpaid);
        let mut events = harness.notifications.subscribe(&challenge.session);

        let sig = key.sign(&challenge.session)?;
        harness
            .auth
            .verify_challenge(&challenge.session, &sig, &key.pubkey)
            .await?;

        assert_eq!(
            harness.sessions.lookup_pubkey(&challenge.session),
            Some(key.pubkey.clone())
        );
        assert_eq!(events.recv().await, Some(BridgeEvent::login(&key.pubkey)));
        assert_eq!(
            events.recv().await,
            Some(BridgeEvent::withdraw(json!({"waiting": true})))
        );
        Ok(())
    }

    #[tokio::test]
    async fn paid_intent_announces_withdraw_lnurl() -> anyhow::Result<()> {
        let harness = harness();
        let key = TestKey::new(7)?;
        let challenge = harness.auth.issue_challenge()?;
        harness.gateway.insert_invoice(
            &format!("inv-espera-{}", key.pubkey),
            21_000,
            InvoiceStatus::Paid,
        );
        let mut events = harness.notifications.subscribe(&challenge.session);

        let sig = key.sign(&challenge.session)?;
        harness
            .auth
            .verify_challenge(&challenge.session, &sig, &key.pubkey)
            .await?;

        let _login = events.recv().await;
        let withdraw = events
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("missing withdraw event"))?;
        assert_eq!(withdraw.kind, EventKind::Withdraw);
        assert_eq!(withdraw.data["ready"], json!(true));
        let lnurl = withdraw.data["lnurl"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing lnurl"))?;
        assert_eq!(
            openagents_lnurl::decode_lnurl(lnurl)?,
            format!(
                "https://bridge.test/withdraw-request?session={}",
                challenge.session
            )
        );
        Ok(())
    }

    #[tokio::test]
    async fn gateway_failure_does_not_fail_login() -> anyhow::Result<()> {
        let harness = harness();
        let key = TestKey::new(7)?;
        let challenge = harness.auth.issue_challenge()?;
        harness.gateway.set_unavailable(Some("connection refused"));
        let mut events = harness.notifications.subscribe(&challenge.session);

        let sig = key.sign(&challenge.session)?;
        harness
            .auth
            .verify_challenge(&challenge.session, &sig, &key.pubkey)
            .await?;

        assert_eq!(events.recv().await, Some(BridgeEvent::login(&key.pubkey)));
        assert!(events.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn bad_signature_leaves_session_unbound() -> anyhow::Result<()> {
        let harness = harness();
        let key = TestKey::new(7)?;
        let other = TestKey::new(9)?;
        let challenge = harness.auth.issue_challenge()?;
        let sig = other.sign(&challenge.session)?;

        let result = harness
            .auth
            .verify_challenge(&challenge.session, &sig, &key.pubkey)
            .await;
        assert!(matches!(result, Err(BridgeError::InvalidSignature(_))));
        assert_eq!(harness.sessions.lookup_pubkey(&challenge.session), None);
        Ok(())
    }

    #[tokio::test]
    async fn rebinding_to_another_key_is_rejected() -> anyhow::Result<()> {
        let harness = harness();
        let first = TestKey::new(7)?;
        let second = TestKey::new(9)?;
        let challenge = harness.auth.issue_challenge()?;

        let sig = first.sign(&challenge.session)?;
        harness
            .auth
            .verify_challenge(&challenge.session, &sig, &first.pubkey)
            .await?;

        let sig = second.sign(&challenge.session)?;
        let result = harness
            .auth
            .verify_challenge(&challenge.session, &sig, &second.pubkey)
            .await;
        assert!(matches!(result, Err(BridgeError::Usage(_))));
        assert_eq!(
            harness.sessions.lookup_pubkey(&challenge.session),
            Some(first.pubkey)
        );
        Ok(())
    }
}
