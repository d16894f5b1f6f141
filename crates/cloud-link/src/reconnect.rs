use std::time::Duration;

use tokio::time::Instant;

/// Counts drops of established connections that follow each other closely.
///
/// A drop within `window` of the previous one extends the chain; a slower drop
/// starts a new chain at one. Once the chain grows past `threshold` the
/// detector fires and starts over.
#[derive(Debug, Clone)]
pub struct FlapDetector {
    window: Duration,
    threshold: u32,
    last_drop: Option<Instant>,
    chain: u32,
}

impl FlapDetector {
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self {
            window,
            threshold,
            last_drop: None,
            chain: 0,
        }
    }

    pub fn record_drop(&mut self, now: Instant) -> bool {
        self.chain = match self.last_drop {
            Some(last) if now.saturating_duration_since(last) < self.window => self.chain + 1,
            _ => 1,
        };
        self.last_drop = Some(now);
        if self.chain > self.threshold {
            self.chain = 0;
            self.last_drop = None;
            return true;
        }
        false
    }

    pub fn chain(&self) -> u32 {
        self.chain
    }
}
