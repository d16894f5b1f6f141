use std::collections::VecDeque;
use std::fmt;

use serde_json::Value;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedOffer {
    pub id: String,
    pub jsep: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedTrickle {
    pub id: String,
    pub candidate: Value,
}

/// One remote peer's signaling state, keyed by the cloud topic it talks on.
#[derive(Debug, Clone)]
pub struct WebRtcSession {
    pub id: String,
    pub gateway_session: Option<u64>,
    pub handle: Option<u64>,
    pub attached: bool,
    pub offer: Option<BufferedOffer>,
    pub offer_sent: bool,
    pub trickles: VecDeque<BufferedTrickle>,
    /// Id of a webrtcup request waiting for the gateway's webrtcup event.
    pub pending_up_ack: Option<String>,
    pub peer_connected: bool,
    /// Transaction of the offer or trickle awaiting the gateway.
    pub in_flight: Option<String>,
    pub created_at: Instant,
}

impl WebRtcSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            gateway_session: None,
            handle: None,
            attached: false,
            offer: None,
            offer_sent: false,
            trickles: VecDeque::new(),
            pending_up_ack: None,
            peer_connected: false,
            in_flight: None,
            created_at: Instant::now(),
        }
    }

    /// Forget everything the gateway assigned. Queued trickles survive.
    pub fn reset_gateway(&mut self) {
        self.gateway_session = None;
        self.handle = None;
        self.attached = false;
        self.peer_connected = false;
        self.in_flight = None;
    }

    pub fn gateway_ids(&self) -> Option<(u64, u64)> {
        match (self.attached, self.gateway_session, self.handle) {
            (true, Some(session), Some(handle)) => Some((session, handle)),
            _ => None,
        }
    }
}

impl fmt::Display for WebRtcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = |value: Option<u64>| value.map(|v| v.to_string()).unwrap_or_else(|| "-".into());
        write!(
            f,
            "{} (gateway session {}, handle {}, attached {}, peer connected {})",
            self.id,
            id(self.gateway_session),
            id(self.handle),
            self.attached,
            self.peer_connected
        )
    }
}
