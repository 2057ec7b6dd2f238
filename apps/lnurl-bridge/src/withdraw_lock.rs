use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Per-label mutual exclusion for in-flight withdrawals.
#[derive(Debug, Clone, Default)]
pub struct WithdrawalLock {
    held: Arc<Mutex<HashSet<String>>>,
}

impl WithdrawalLock {
    /// Atomically claim `label`. Returns `None` when another withdrawal holds it.
    #[must_use]
    pub fn try_acquire(&self, label: &str) -> Option<WithdrawalLockGuard> {
        if !self.held().insert(label.to_string()) {
            return None;
        }
        Some(WithdrawalLockGuard {
            lock: self.clone(),
            label: label.to_string(),
        })
    }

    #[must_use]
    pub fn is_held(&self, label: &str) -> bool {
        self.held().contains(label)
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the label when dropped, including on panic unwind.
#[derive(Debug)]
pub struct WithdrawalLockGuard {
    lock: WithdrawalLock,
    label: String,
}

impl WithdrawalLockGuard {
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for WithdrawalLockGuard {
    fn drop(&mut self) {
        self.lock.held().remove(&self.label);
        tracing::debug!(
            target: "lnurl_bridge.withdraw",
            label = %self.label,
            "released withdrawal lock"
        );
    }
}
