//! [`BrokerLink`] over an in-process [`Bus`], standing in for a broker.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;
use transport_bus::Bus;

use crate::error::LinkError;
use crate::link::{BrokerLink, BrokerTarget, Completion, LinkEvent, RequestId, RequestIds};

pub struct BusLink {
    bus: Arc<dyn Bus>,
    events: mpsc::UnboundedSender<LinkEvent>,
    ids: RequestIds,
    forwarders: Option<Vec<JoinHandle<()>>>,
}

impl BusLink {
    pub fn new(bus: Arc<dyn Bus>, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            bus,
            events,
            ids: RequestIds::default(),
            forwarders: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.forwarders.is_some()
    }

    /// Ends the session as if the network went away.
    pub fn drop_connection(&mut self, reason: &str) {
        if self.close() {
            let _ = self.events.send(LinkEvent::Disconnected {
                reason: Some(reason.to_string()),
            });
        }
    }

    fn close(&mut self) -> bool {
        match self.forwarders.take() {
            Some(tasks) => {
                for task in tasks {
                    task.abort();
                }
                true
            }
            None => false,
        }
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!(target: "hub_remote::cloud", "link event receiver dropped");
        }
    }
}

impl BrokerLink for BusLink {
    fn connect(&mut self, target: &BrokerTarget) -> Result<(), LinkError> {
        self.close();
        debug!(
            target: "hub_remote::cloud",
            client_id = %target.client_id,
            "opening in-process broker session"
        );
        self.forwarders = Some(Vec::new());
        self.emit(LinkEvent::Connected);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        if !self.close() {
            return Err(LinkError::NotConnected);
        }
        self.emit(LinkEvent::Disconnected { reason: None });
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<RequestId, LinkError> {
        if !self.is_open() {
            return Err(LinkError::NotConnected);
        }
        self.bus.publish(topic, payload)?;
        let request = self.ids.next();
        self.emit(LinkEvent::Completed {
            request,
            completion: Completion::Published,
        });
        Ok(request)
    }

    fn subscribe(&mut self, filters: &[String]) -> Result<RequestId, LinkError> {
        let Some(tasks) = self.forwarders.as_mut() else {
            return Err(LinkError::NotConnected);
        };
        for filter in filters {
            let mut receiver = self.bus.subscribe(filter)?;
            let events = self.events.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => {
                            let event = LinkEvent::Message {
                                topic: message.topic,
                                payload: message.payload,
                            };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(target: "hub_remote::cloud", skipped, "bus subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }
        let request = self.ids.next();
        self.emit(LinkEvent::Completed {
            request,
            completion: Completion::Subscribed { granted: true },
        });
        Ok(request)
    }
}
