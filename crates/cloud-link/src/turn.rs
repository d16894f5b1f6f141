use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

/// Refresh this long before the credentials expire.
pub const REFRESH_MARGIN: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct TurnCache {
    credentials: Option<(Value, Instant)>,
    refresh_at: Option<Instant>,
}

impl TurnCache {
    pub fn store(&mut self, credentials: Value, now: Instant) {
        let ttl = credentials
            .get("ttl")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or_default();
        if ttl > REFRESH_MARGIN {
            self.refresh_at = Some(now + ttl - REFRESH_MARGIN);
            self.credentials = Some((credentials, now + ttl));
        } else {
            self.refresh_at = None;
            self.credentials = None;
        }
    }

    pub fn valid(&self, now: Instant) -> Option<Value> {
        match &self.credentials {
            Some((credentials, expires_at)) if now < *expires_at => Some(credentials.clone()),
            _ => None,
        }
    }

    /// True once per scheduled refresh.
    pub fn take_refresh_due(&mut self, now: Instant) -> bool {
        match self.refresh_at {
            Some(at) if now >= at => {
                self.refresh_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.credentials = None;
        self.refresh_at = None;
    }
}
