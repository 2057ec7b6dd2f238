use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::Config;
use crate::error::BridgeError;
use crate::gateway::{InvoiceStatus, PaymentGateway};
use crate::notifications::{BridgeEvent, NotificationHub};
use crate::sessions::{SessionRegistry, idle_longer_than};
use crate::withdraw_lock::{WithdrawalLock, WithdrawalLockGuard};

const WITHDRAW_TAG: &str = "withdrawRequest";

/// Gateway label holding the outstanding invoice for `pubkey`.
pub fn invoice_label(prefix: &str, pubkey: &str) -> String {
    format!("{prefix}{pubkey}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    None,
    Open { amount_msat: u64 },
    Paid { amount_msat: u64 },
}

impl IntentStatus {
    pub fn amount_msat(self) -> Option<u64> {
        match self {
            Self::None => None,
            Self::Open { amount_msat } | Self::Paid { amount_msat } => Some(amount_msat),
        }
    }

    /// Gateway status of the invoice backing this intent.
    pub fn invoice_status(self) -> Option<InvoiceStatus> {
        match self {
            Self::None => None,
            Self::Open { .. } => Some(InvoiceStatus::Unpaid),
            Self::Paid { .. } => Some(InvoiceStatus::Paid),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawParams {
    pub callback: String,
    pub k1: String,
    pub min_withdrawable: u64,
    pub max_withdrawable: u64,
    pub default_description: String,
    pub tag: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithdrawAccepted {
    pub settlement_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SettlementState {
    Pending,
    Paid,
    Failed { reason: String },
}

impl SettlementState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug)]
struct SettlementEntry {
    state: watch::Sender<SettlementState>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SettlementTracker {
    entries: Mutex<HashMap<Uuid, SettlementEntry>>,
}

impl SettlementTracker {
    fn start(&self) -> Uuid {
        let id = Uuid::new_v4();
        let (state, _) = watch::channel(SettlementState::Pending);
        self.entries().insert(
            id,
            SettlementEntry {
                state,
                finished_at: None,
            },
        );
        id
    }

    fn finish(&self, id: Uuid, outcome: SettlementState) {
        if let Some(entry) = self.entries().get_mut(&id) {
            entry.state.send_replace(outcome);
            entry.finished_at = Some(Utc::now());
        }
    }

    fn get(&self, id: Uuid) -> Option<SettlementState> {
        self.entries()
            .get(&id)
            .map(|entry| entry.state.borrow().clone())
    }

    fn subscribe(&self, id: Uuid) -> Option<watch::Receiver<SettlementState>> {
        self.entries().get(&id).map(|entry| entry.state.subscribe())
    }

    fn sweep_finished(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| {
            entry
                .finished_at
                .is_none_or(|finished_at| !idle_longer_than(finished_at, now, ttl))
        });
        before - entries.len()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<Uuid, SettlementEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Withdrawal parameters, validation, and the background settlement lifecycle.
pub struct WithdrawalFlow {
    gateway: Arc<dyn PaymentGateway>,
    sessions: Arc<SessionRegistry>,
    notifications: Arc<NotificationHub>,
    lock: WithdrawalLock,
    settlements: Arc<SettlementTracker>,
    service_url: String,
    label_prefix: String,
    description: String,
    pay_timeout: Duration,
}

impl WithdrawalFlow {
    pub fn new(
        config: &Config,
        gateway: Arc<dyn PaymentGateway>,
        sessions: Arc<SessionRegistry>,
        notifications: Arc<NotificationHub>,
    ) -> Self {
        Self {
            gateway,
            sessions,
            notifications,
            lock: WithdrawalLock::default(),
            settlements: Arc::new(SettlementTracker::default()),
            service_url: config.service_url.clone(),
            label_prefix: config.label_prefix.clone(),
            description: config.withdraw_description.clone(),
            pay_timeout: Duration::from_secs(config.gateway_timeout_seconds),
        }
    }

    pub fn label_for(&self, pubkey: &str) -> String {
        invoice_label(&self.label_prefix, pubkey)
    }

    pub fn lock(&self) -> &WithdrawalLock {
        &self.lock
    }

    pub async fn status_query(&self, pubkey: &str) -> Result<IntentStatus, BridgeError> {
        let invoice = self.gateway.find_invoice(&self.label_for(pubkey)).await?;
        Ok(match invoice {
            Some(invoice) => match invoice.status {
                InvoiceStatus::Unpaid => IntentStatus::Open {
                    amount_msat: invoice.amount_msat,
                },
                InvoiceStatus::Paid => IntentStatus::Paid {
                    amount_msat: invoice.amount_msat,
                },
                InvoiceStatus::Expired => IntentStatus::None,
            },
            None => IntentStatus::None,
        })
    }

    /// Payload of the `withdraw` event describing `status` to the session.
    pub fn withdraw_state(&self, session: &str, status: IntentStatus) -> Result<Value, BridgeError> {
        Ok(match status {
            IntentStatus::Paid { .. } => json!({
                "ready": true,
                "lnurl": self.withdraw_lnurl(session)?,
            }),
            IntentStatus::Open { .. } => json!({ "waiting": true }),
            IntentStatus::None => json!({ "waiting": false }),
        })
    }

    pub fn withdraw_lnurl(&self, session: &str) -> Result<String, BridgeError> {
        let url = format!("{}/withdraw-request?session={session}", self.service_url);
        Ok(openagents_lnurl::encode_lnurl(&url)?)
    }

    pub async fn issue_withdraw_params(&self, session: &str) -> Result<WithdrawParams, BridgeError> {
        let pubkey = self.bound_pubkey(session)?;
        let amount_msat = self
            .status_query(&pubkey)
            .await?
            .amount_msat()
            .ok_or_else(|| BridgeError::usage("there is no open withdrawal for this session"))?;

        let mut k1 = openagents_lnurl::random_k1();
        while k1 == session {
            k1 = openagents_lnurl::random_k1();
        }
        self.sessions.record_withdraw_nonce(session, &k1)?;

        tracing::debug!(
            target: "lnurl_bridge.withdraw",
            session,
            pubkey = %pubkey,
            amount_msat,
            "issued withdraw parameters"
        );

        Ok(WithdrawParams {
            callback: format!("{}/withdraw-callback?session={session}", self.service_url),
            k1,
            min_withdrawable: amount_msat,
            max_withdrawable: amount_msat,
            default_description: self.description.clone(),
            tag: WITHDRAW_TAG,
        })
    }

    pub async fn execute_withdraw(
        &self,
        session: &str,
        k1: &str,
        sig: &str,
        payment_request: &str,
    ) -> Result<WithdrawAccepted, BridgeError> {
        let pubkey = self.bound_pubkey(session)?;
        let label = self.label_for(&pubkey);

        openagents_lnurl::verify_signature(k1, sig, &pubkey).map_err(|error| {
            tracing::warn!(
                target: "lnurl_bridge.withdraw",
                session,
                pubkey = %pubkey,
                error = %error,
                "withdraw signature verification failed"
            );
            BridgeError::InvalidSignature(error.to_string())
        })?;

        let intent = self.status_query(&pubkey).await?;
        let (Some(expected_msat), Some(intent_status)) =
            (intent.amount_msat(), intent.invoice_status())
        else {
            return Err(BridgeError::usage(
                "there is no open withdrawal for this session",
            ));
        };

        let decoded = self
            .gateway
            .decode_payment_request(payment_request)
            .await
            .map_err(|error| BridgeError::InvalidPaymentRequest(error.to_string()))?;
        let received_msat = decoded.amount_msat.ok_or_else(|| {
            BridgeError::InvalidPaymentRequest("payment request has no amount".to_string())
        })?;
        if received_msat != expected_msat {
            return Err(BridgeError::AmountMismatch {
                expected_msat,
                received_msat,
            });
        }

        let Some(guard) = self.lock.try_acquire(&label) else {
            tracing::warn!(
                target: "lnurl_bridge.withdraw",
                session,
                label = %label,
                "rejected concurrent withdrawal"
            );
            return Err(BridgeError::DuplicateWithdrawal);
        };
        // taken under the lock so an in-flight duplicate reports a conflict
        self.sessions.take_withdraw_nonce(session, k1)?;

        let settlement_id = self.settlements.start();
        self.notifications
            .publish(session, BridgeEvent::withdraw(json!({ "processing": true })));

        tracing::info!(
            target: "lnurl_bridge.withdraw",
            session,
            label = %label,
            settlement_id = %settlement_id,
            amount_msat = expected_msat,
            "dispatching withdrawal settlement"
        );

        let task = Settlement {
            id: settlement_id,
            session: session.to_string(),
            payment_request: payment_request.to_string(),
            intent_status,
            guard,
            gateway: Arc::clone(&self.gateway),
            notifications: Arc::clone(&self.notifications),
            settlements: Arc::clone(&self.settlements),
            pay_timeout: self.pay_timeout,
        };
        tokio::spawn(task.run());

        Ok(WithdrawAccepted { settlement_id })
    }

    pub async fn cancel_intent(&self, session: &str) -> Result<(), BridgeError> {
        let pubkey = self.bound_pubkey(session)?;
        let label = self.label_for(&pubkey);
        self.gateway
            .delete_invoice(&label, InvoiceStatus::Unpaid)
            .await
            .map_err(|error| {
                tracing::warn!(
                    target: "lnurl_bridge.withdraw",
                    session,
                    label = %label,
                    error = %error,
                    "failed to cancel withdrawal intent"
                );
                BridgeError::from(error)
            })?;

        self.notifications
            .publish(session, BridgeEvent::withdraw(json!({ "waiting": false })));
        self.notifications
            .publish(session, BridgeEvent::btc_deposit(Value::Null));
        Ok(())
    }

    pub fn settlement(&self, id: Uuid) -> Option<SettlementState> {
        self.settlements.get(id)
    }

    /// Resolve once settlement `id` reaches a terminal state.
    pub async fn wait_for_settlement(&self, id: Uuid) -> Option<SettlementState> {
        let mut receiver = self.settlements.subscribe(id)?;
        receiver
            .wait_for(SettlementState::is_terminal)
            .await
            .ok()
            .map(|state| state.clone())
    }

    pub fn sweep_settlements(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        self.settlements.sweep_finished(now, ttl)
    }

    fn bound_pubkey(&self, session: &str) -> Result<String, BridgeError> {
        self.sessions
            .lookup_pubkey(session)
            .ok_or_else(|| BridgeError::usage("session is not authenticated"))
    }
}

struct Settlement {
    id: Uuid,
    session: String,
    payment_request: String,
    intent_status: InvoiceStatus,
    guard: WithdrawalLockGuard,
    gateway: Arc<dyn PaymentGateway>,
    notifications: Arc<NotificationHub>,
    settlements: Arc<SettlementTracker>,
    pay_timeout: Duration,
}

impl Settlement {
    async fn run(self) {
        let label = self.guard.label().to_string();
        let paid = tokio::time::timeout(
            self.pay_timeout,
            self.gateway.wait_pay(&self.payment_request),
        )
        .await;
        let outcome = match paid {
            Ok(Ok(_receipt)) => {
                tracing::info!(
                    target: "lnurl_bridge.withdraw",
                    session = %self.session,
                    label = %label,
                    settlement_id = %self.id,
                    "withdrawal paid"
                );
                SettlementState::Paid
            }
            Ok(Err(error)) => {
                tracing::warn!(
                    target: "lnurl_bridge.withdraw",
                    session = %self.session,
                    label = %label,
                    settlement_id = %self.id,
                    error = %error,
                    "withdrawal payment failed"
                );
                SettlementState::Failed {
                    reason: error.to_string(),
                }
            }
            Err(_) => {
                tracing::warn!(
                    target: "lnurl_bridge.withdraw",
                    session = %self.session,
                    label = %label,
                    settlement_id = %self.id,
                    timeout_seconds = self.pay_timeout.as_secs(),
                    "withdrawal payment timed out"
                );
                SettlementState::Failed {
                    reason: "payment timed out".to_string(),
                }
            }
        };

        if let Err(error) = self
            .gateway
            .delete_invoice(&label, self.intent_status)
            .await
        {
            tracing::warn!(
                target: "lnurl_bridge.withdraw",
                label = %label,
                status = self.intent_status.as_str(),
                settlement_id = %self.id,
                error = %error,
                "failed to delete settled invoice"
            );
        }

        drop(self.guard);

        if self.notifications.is_connected(&self.session) {
            self.notifications.publish(
                &self.session,
                BridgeEvent::withdraw(json!({ "processed": true })),
            );
        }
        self.settlements.finish(self.id, outcome);
    }
}
