use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::link::RequestId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    Publish { topic: String },
    Subscribe { filters: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct PendingPacket {
    pub kind: PacketKind,
    pub issued_at: Instant,
}

/// Outstanding publish and subscribe requests awaiting broker acknowledgement.
#[derive(Debug, Default)]
pub struct PacketTracker {
    pending: HashMap<RequestId, PendingPacket>,
}

impl PacketTracker {
    pub fn track(&mut self, request: RequestId, kind: PacketKind, now: Instant) {
        if let Some(previous) = self.pending.insert(
            request,
            PendingPacket {
                kind,
                issued_at: now,
            },
        ) {
            tracing::debug!(
                target: "hub_remote::cloud",
                request,
                previous = ?previous.kind,
                "request id reused before acknowledgement"
            );
        }
    }

    /// Each acknowledgement consumes its entry; a second one finds nothing.
    pub fn complete(&mut self, request: RequestId) -> Option<PendingPacket> {
        self.pending.remove(&request)
    }

    pub fn reap_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn expire(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, packet| now.saturating_duration_since(packet.issued_at) < ttl);
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
