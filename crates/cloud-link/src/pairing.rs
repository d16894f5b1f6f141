use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
struct PendingPairing {
    user_id: String,
    issued_at: Instant,
}

/// Pair requests waiting for a cloud response, keyed by transaction id.
#[derive(Debug, Default)]
pub struct PairingLedger {
    pending: BTreeMap<u64, PendingPairing>,
}

impl PairingLedger {
    pub fn insert(&mut self, transaction: u64, user_id: impl Into<String>, now: Instant) {
        self.pending.insert(
            transaction,
            PendingPairing {
                user_id: user_id.into(),
                issued_at: now,
            },
        );
    }

    pub fn take(&mut self, transaction: u64) -> Option<String> {
        self.pending.remove(&transaction).map(|entry| entry.user_id)
    }

    /// Removes and returns entries older than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<(u64, String)> {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.issued_at) >= timeout)
            .map(|(transaction, _)| *transaction)
            .collect();
        expired
            .into_iter()
            .filter_map(|transaction| {
                self.pending
                    .remove(&transaction)
                    .map(|entry| (transaction, entry.user_id))
            })
            .collect()
    }

    pub fn drain(&mut self) -> Vec<(u64, String)> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(transaction, entry)| (transaction, entry.user_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
