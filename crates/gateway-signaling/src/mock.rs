//! Scripted [`GatewayLink`] that records outbound frames.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::GatewayError;
use crate::link::GatewayLink;

#[derive(Debug, Default)]
struct Script {
    open: bool,
    refuse_open: bool,
    opens: usize,
    generation: u64,
    frames: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedGatewayLink {
    inner: Arc<Mutex<Script>>,
}

impl ScriptedGatewayLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refusing() -> Self {
        let link = Self::default();
        link.set_refuse_open(true);
        link
    }

    pub fn set_refuse_open(&self, refuse: bool) {
        self.inner.lock().refuse_open = refuse;
    }

    pub fn opens(&self) -> usize {
        self.inner.lock().opens
    }

    pub fn frames(&self) -> Vec<Value> {
        self.inner.lock().frames.clone()
    }

    pub fn take_frames(&self) -> Vec<Value> {
        std::mem::take(&mut self.inner.lock().frames)
    }

    /// Frames other than heartbeats.
    pub fn requests(&self) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter(|frame| frame["janus"] != "ping")
            .collect()
    }

    pub fn last_request(&self) -> Option<Value> {
        self.requests().pop()
    }
}

impl GatewayLink for ScriptedGatewayLink {
    fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    fn open(&mut self) -> Result<(), GatewayError> {
        let mut script = self.inner.lock();
        script.opens += 1;
        if script.refuse_open {
            return Err(GatewayError::NotConnected);
        }
        script.open = true;
        script.generation += 1;
        Ok(())
    }

    fn send(&mut self, frame: String) -> Result<(), GatewayError> {
        let mut script = self.inner.lock();
        if !script.open {
            return Err(GatewayError::NotConnected);
        }
        let value = serde_json::from_str(&frame)?;
        script.frames.push(value);
        Ok(())
    }

    fn close(&mut self) {
        self.inner.lock().open = false;
    }
}
