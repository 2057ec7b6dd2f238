use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::sessions::idle_longer_than;

const LISTENER_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Login,
    Withdraw,
    BtcDeposit,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Withdraw => "withdraw",
            Self::BtcDeposit => "btc-deposit",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEvent {
    pub kind: EventKind,
    pub data: Value,
}

impl BridgeEvent {
    #[must_use]
    pub fn login(pubkey: &str) -> Self {
        Self {
            kind: EventKind::Login,
            data: Value::String(pubkey.to_string()),
        }
    }

    #[must_use]
    pub fn withdraw(data: Value) -> Self {
        Self {
            kind: EventKind::Withdraw,
            data,
        }
    }

    #[must_use]
    pub fn btc_deposit(data: Value) -> Self {
        Self {
            kind: EventKind::BtcDeposit,
            data,
        }
    }

    /// Serialized `data` payload as sent over the event stream.
    #[must_use]
    pub fn payload(&self) -> String {
        self.data.to_string()
    }
}

#[derive(Debug)]
struct Channel {
    listener: Option<mpsc::Sender<BridgeEvent>>,
    last_activity: DateTime<Utc>,
}

impl Channel {
    fn is_connected(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.is_closed())
    }
}

/// Per-session notification channels with at most one live listener each.
#[derive(Debug, Default)]
pub struct NotificationHub {
    channels: Mutex<HashMap<String, Channel>>,
}

impl NotificationHub {
    /// Attach a listener to `session`, replacing any previous one.
    pub fn subscribe(&self, session: &str) -> mpsc::Receiver<BridgeEvent> {
        let (sender, receiver) = mpsc::channel(LISTENER_BUFFER);
        let mut channels = self.channels();
        let channel = channels.entry(session.to_string()).or_insert(Channel {
            listener: None,
            last_activity: Utc::now(),
        });
        if channel.listener.replace(sender).is_some() {
            tracing::debug!(
                target: "lnurl_bridge.events",
                session,
                "replaced existing event listener"
            );
        }
        channel.last_activity = Utc::now();
        receiver
    }

    /// Deliver `event` to the session's listener. Returns whether it was delivered.
    pub fn publish(&self, session: &str, event: BridgeEvent) -> bool {
        let mut channels = self.channels();
        let Some(channel) = channels.get_mut(session) else {
            return false;
        };
        let Some(listener) = channel.listener.as_ref() else {
            return false;
        };
        let kind = event.kind.as_str();
        match listener.try_send(event) {
            Ok(()) => {
                channel.last_activity = Utc::now();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    target: "lnurl_bridge.events",
                    session,
                    event = kind,
                    "event listener is lagging, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                channel.listener = None;
                false
            }
        }
    }

    #[must_use]
    pub fn is_connected(&self, session: &str) -> bool {
        self.channels()
            .get(session)
            .is_some_and(Channel::is_connected)
    }

    /// Drop channels that have no live listener and have been idle for `ttl`.
    pub fn sweep_idle(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut channels = self.channels();
        let before = channels.len();
        channels.retain(|_, channel| {
            channel.is_connected() || !idle_longer_than(channel.last_activity, now, ttl)
        });
        before - channels.len()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
