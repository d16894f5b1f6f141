//! In-memory [`BrokerLink`] that records every call. The caller feeds link
//! events to the connector by hand.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::LinkError;
use crate::link::{BrokerLink, BrokerTarget, RequestId, RequestIds};

#[derive(Debug, Clone, PartialEq)]
pub enum LinkCall {
    Connect { client_id: String },
    Disconnect,
    Publish {
        request: RequestId,
        topic: String,
        payload: Bytes,
    },
    Subscribe {
        request: RequestId,
        filters: Vec<String>,
    },
}

#[derive(Debug, Default)]
struct Recorded {
    calls: Vec<LinkCall>,
    ids: RequestIds,
    open: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingLink {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<LinkCall> {
        self.inner.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<LinkCall> {
        std::mem::take(&mut self.inner.lock().calls)
    }

    /// Publishes recorded so far, payloads decoded as JSON.
    pub fn published(&self) -> Vec<(RequestId, String, Value)> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                LinkCall::Publish {
                    request,
                    topic,
                    payload,
                } => Some((
                    *request,
                    topic.clone(),
                    serde_json::from_slice(payload).unwrap_or(Value::Null),
                )),
                _ => None,
            })
            .collect()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Value> {
        self.published()
            .into_iter()
            .filter(|(_, published, _)| published == topic)
            .map(|(_, _, payload)| payload)
            .collect()
    }

    pub fn subscribed(&self) -> Vec<(RequestId, Vec<String>)> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                LinkCall::Subscribe { request, filters } => Some((*request, filters.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, LinkCall::Connect { .. }))
            .count()
    }
}

impl BrokerLink for RecordingLink {
    fn connect(&mut self, target: &BrokerTarget) -> Result<(), LinkError> {
        let mut inner = self.inner.lock();
        inner.open = true;
        inner.calls.push(LinkCall::Connect {
            client_id: target.client_id.clone(),
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(LinkError::NotConnected);
        }
        inner.open = false;
        inner.calls.push(LinkCall::Disconnect);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<RequestId, LinkError> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(LinkError::NotConnected);
        }
        let request = inner.ids.next();
        inner.calls.push(LinkCall::Publish {
            request,
            topic: topic.to_string(),
            payload,
        });
        Ok(request)
    }

    fn subscribe(&mut self, filters: &[String]) -> Result<RequestId, LinkError> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(LinkError::NotConnected);
        }
        let request = inner.ids.next();
        inner.calls.push(LinkCall::Subscribe {
            request,
            filters: filters.to_vec(),
        });
        Ok(request)
    }
}
