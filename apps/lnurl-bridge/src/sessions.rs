use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::BridgeError;

#[derive(Debug, Clone)]
struct SessionEntry {
    pubkey: Option<String>,
    withdraw_nonce: Option<String>,
    last_activity: DateTime<Utc>,
}

impl SessionEntry {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            pubkey: None,
            withdraw_nonce: None,
            last_activity: now,
        }
    }
}

/// In-memory session to pubkey bindings.
///
/// Sessions are identified by their login `k1`. Entries only exist once a
/// session has been bound; an issued but never answered challenge leaves no
/// trace here.
#[derive(Debug)]
pub struct SessionRegistry {
    ttl: Duration,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh session id. Nothing is stored until the session is bound.
    #[must_use]
    pub fn create_session(&self) -> String {
        openagents_lnurl::random_k1()
    }

    pub fn bind_pubkey(&self, session: &str, pubkey: &str) -> Result<(), BridgeError> {
        let now = Utc::now();
        let mut sessions = self.sessions();
        let entry = sessions
            .entry(session.to_string())
            .or_insert_with(|| SessionEntry::new(now));
        match entry.pubkey.as_deref() {
            Some(existing) if existing != pubkey => {
                return Err(BridgeError::usage("session is already bound to another key"));
            }
            Some(_) => {}
            None => entry.pubkey = Some(pubkey.to_string()),
        }
        entry.last_activity = now;
        Ok(())
    }

    #[must_use]
    pub fn lookup_pubkey(&self, session: &str) -> Option<String> {
        let mut sessions = self.sessions();
        let entry = sessions.get_mut(session)?;
        entry.last_activity = Utc::now();
        entry.pubkey.clone()
    }

    /// Remember the nonce handed out with the latest withdraw parameters.
    pub fn record_withdraw_nonce(&self, session: &str, nonce: &str) -> Result<(), BridgeError> {
        let mut sessions = self.sessions();
        let entry = sessions
            .get_mut(session)
            .filter(|entry| entry.pubkey.is_some())
            .ok_or_else(|| BridgeError::usage("session is not authenticated"))?;
        entry.withdraw_nonce = Some(nonce.to_string());
        entry.last_activity = Utc::now();
        Ok(())
    }

    #[must_use]
    pub fn withdraw_nonce(&self, session: &str) -> Option<String> {
        self.sessions()
            .get(session)
            .and_then(|entry| entry.withdraw_nonce.clone())
    }

    /// Consume the issued withdraw nonce if it equals `nonce`.
    pub fn take_withdraw_nonce(&self, session: &str, nonce: &str) -> Result<(), BridgeError> {
        let mut sessions = self.sessions();
        let entry = sessions
            .get_mut(session)
            .ok_or_else(|| BridgeError::usage("session is not authenticated"))?;
        match entry.withdraw_nonce.as_deref() {
            None => Err(BridgeError::usage(
                "no withdraw request was issued for this session",
            )),
            Some(issued) if issued != nonce => Err(BridgeError::usage(
                "k1 does not match the issued withdraw request",
            )),
            Some(_) => {
                entry.withdraw_nonce = None;
                entry.last_activity = Utc::now();
                Ok(())
            }
        }
    }

    /// Drop sessions idle for longer than the configured TTL.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, entry| !idle_longer_than(entry.last_activity, now, self.ttl));
        before - sessions.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, session: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.sessions().get_mut(session) {
            entry.last_activity = at;
        }
    }
}

pub(crate) fn idle_longer_than(last: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    now.signed_duration_since(last)
        .to_std()
        .is_ok_and(|idle| idle > ttl)
}
