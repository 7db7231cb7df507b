use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A pooled channel account row.
///
/// Locks are ledger-range leases: a row is held while the current ledger is
/// at or below `locked_until_ledger`, and becomes available again on its own
/// once the network moves past it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelAccount {
    pub public_key: String,
    /// Encrypted seed, or a raw seed for pools provisioned without a passphrase
    pub private_key: String,
    pub locked_at_ledger: Option<u32>,
    pub locked_until_ledger: Option<u32>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelAccount {
    pub fn new(public_key: impl Into<String>, private_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            public_key: public_key.into(),
            private_key: private_key.into(),
            locked_at_ledger: None,
            locked_until_ledger: None,
            locked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_locked(&self, current_ledger: u32) -> bool {
        self.locked_until_ledger
            .is_some_and(|until| current_ledger <= until)
    }

    /// Ledger 0 means "ignore leases".
    pub fn is_available(&self, current_ledger: u32) -> bool {
        current_ledger == 0 || !self.is_locked(current_ledger)
    }

    pub(crate) fn apply_lock(&mut self, current_ledger: u32, locked_until_ledger: u32) {
        let now = Utc::now();
        self.locked_at_ledger = Some(current_ledger);
        self.locked_until_ledger = Some(locked_until_ledger);
        self.locked_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn apply_unlock(&mut self) {
        self.locked_at_ledger = None;
        self.locked_until_ledger = None;
        self.locked_at = None;
        self.updated_at = Utc::now();
    }

    /// Lease still reaches `ledger`
    pub(crate) fn lock_covers(&self, ledger: u32) -> bool {
        self.locked_until_ledger.is_some_and(|until| until >= ledger)
    }
}

impl std::fmt::Debug for ChannelAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelAccount")
            .field("public_key", &self.public_key)
            .field("locked_at_ledger", &self.locked_at_ledger)
            .field("locked_until_ledger", &self.locked_until_ledger)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Row to insert; the seed is already encrypted by the caller.
#[derive(Clone, PartialEq, Eq)]
pub struct NewChannelAccount {
    pub public_key: String,
    pub private_key: String,
}

impl std::fmt::Debug for NewChannelAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NewChannelAccount")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_window() {
        let mut account = ChannelAccount::new("GABC", "secret");
        assert!(!account.is_locked(100));

        account.apply_lock(100, 110);
        assert!(account.is_locked(100));
        assert!(account.is_locked(110));
        assert!(!account.is_locked(111));
        assert!(account.is_available(0));
        assert!(!account.is_available(105));

        assert!(account.lock_covers(110));
        assert!(!account.lock_covers(111));

        account.apply_unlock();
        assert!(account.locked_at.is_none());
        assert!(!account.lock_covers(0));
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let account = ChannelAccount::new("GABC", "SSECRETSEED");
        assert!(!format!("{:?}", account).contains("SSECRETSEED"));
    }
}
