use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Registration facts that must survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredIdentity {
    #[serde(default)]
    pub registered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_name: Option<String>,
}

pub trait IdentityStore: Send {
    fn registered(&self) -> bool;
    fn set_registered(&mut self, registered: bool);
    /// Name the cloud last acknowledged for this device.
    fn synced_name(&self) -> Option<String>;
    fn set_synced_name(&mut self, name: Option<&str>);
}

/// Store kept in memory. Clones share state so callers can inspect what the
/// connector wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdentityStore {
    inner: Arc<Mutex<StoredIdentity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: StoredIdentity) -> Self {
        Self {
            inner: Arc::new(Mutex::new(identity)),
        }
    }

    pub fn snapshot(&self) -> StoredIdentity {
        self.inner.lock().clone()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn registered(&self) -> bool {
        self.inner.lock().registered
    }

    fn set_registered(&mut self, registered: bool) {
        self.inner.lock().registered = registered;
    }

    fn synced_name(&self) -> Option<String> {
        self.inner.lock().synced_name.clone()
    }

    fn set_synced_name(&mut self, name: Option<&str>) {
        self.inner.lock().synced_name = name.map(str::to_string);
    }
}
