//! [`BrokerLink`] backed by rumqttc over mutual TLS.
//!
//! The rumqttc client does not hand back packet ids, so request ids are queued
//! in submission order and paired with the packet ids the event loop reports
//! as it sends each publish or subscribe.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::LinkError;
use crate::link::{BrokerLink, BrokerTarget, Completion, LinkEvent, RequestId, RequestIds};

const REQUEST_CAPACITY: usize = 64;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

type Submitted = Arc<Mutex<VecDeque<RequestId>>>;

struct MqttSession {
    client: AsyncClient,
    submitted: Submitted,
    connected: Arc<AtomicBool>,
    poller: JoinHandle<()>,
}

pub struct MqttLink {
    events: mpsc::UnboundedSender<LinkEvent>,
    ids: RequestIds,
    session: Option<MqttSession>,
}

impl MqttLink {
    pub fn new(events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            events,
            ids: RequestIds::default(),
            session: None,
        }
    }

    fn session(&self) -> Result<&MqttSession, LinkError> {
        self.session.as_ref().ok_or(LinkError::NotConnected)
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.poller.abort();
        }
    }
}

impl BrokerLink for MqttLink {
    fn connect(&mut self, target: &BrokerTarget) -> Result<(), LinkError> {
        if let Some(previous) = self.session.take() {
            previous.poller.abort();
        }

        let mut options = MqttOptions::new(&target.client_id, &target.host, target.port);
        options.set_keep_alive(target.keep_alive);
        options.set_clean_session(true);
        if let Some(tls) = &target.tls {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: tls.ca.clone(),
                alpn: None,
                client_auth: Some((tls.client_cert.clone(), tls.client_key.clone())),
            }));
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let submitted = Submitted::default();
        let connected = Arc::new(AtomicBool::new(false));
        let poller = tokio::spawn(poll_broker(
            eventloop,
            Arc::clone(&submitted),
            Arc::clone(&connected),
            self.events.clone(),
            target.connect_timeout,
            target.max_backoff,
        ));
        debug!(
            target: "hub_remote::cloud",
            host = %target.host,
            port = target.port,
            client_id = %target.client_id,
            "mqtt session started"
        );
        self.session = Some(MqttSession {
            client,
            submitted,
            connected,
            poller,
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        let session = self.session.take().ok_or(LinkError::NotConnected)?;
        if session.connected.load(Ordering::Acquire) {
            if session.client.try_disconnect().is_ok() {
                // the poller reports Disconnected once the packet is out
                return Ok(());
            }
            warn!(target: "hub_remote::cloud", "request queue full; dropping mqtt session");
        }
        session.poller.abort();
        let _ = self.events.send(LinkEvent::Disconnected { reason: None });
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<RequestId, LinkError> {
        self.session()?;
        let request = self.ids.next();
        let session = self.session()?;
        session.submitted.lock().push_back(request);
        if let Err(err) =
            session
                .client
                .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
        {
            session.submitted.lock().pop_back();
            return Err(LinkError::Rejected(err.to_string()));
        }
        Ok(request)
    }

    fn subscribe(&mut self, filters: &[String]) -> Result<RequestId, LinkError> {
        self.session()?;
        let request = self.ids.next();
        let session = self.session()?;
        let filters: Vec<SubscribeFilter> = filters
            .iter()
            .map(|filter| SubscribeFilter::new(filter.clone(), QoS::AtLeastOnce))
            .collect();
        session.submitted.lock().push_back(request);
        if let Err(err) = session.client.try_subscribe_many(filters) {
            session.submitted.lock().pop_back();
            return Err(LinkError::Rejected(err.to_string()));
        }
        Ok(request)
    }
}

async fn poll_broker(
    mut eventloop: EventLoop,
    submitted: Submitted,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LinkEvent>,
    connect_timeout: Duration,
    max_backoff: Duration,
) {
    let mut inflight: HashMap<u16, RequestId> = HashMap::new();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let polled = if connected.load(Ordering::Acquire) {
            eventloop.poll().await
        } else {
            match tokio::time::timeout(connect_timeout, eventloop.poll()).await {
                Ok(polled) => polled,
                Err(_) => {
                    if events
                        .send(LinkEvent::ConnectFailed {
                            reason: "connect timed out".to_string(),
                        })
                        .is_err()
                    {
                        return;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                    continue;
                }
            }
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::Release);
                backoff = INITIAL_BACKOFF;
                Some(LinkEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(LinkEvent::Message {
                topic: publish.topic,
                payload: publish.payload,
            }),
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                inflight
                    .remove(&ack.pkid)
                    .map(|request| LinkEvent::Completed {
                        request,
                        completion: Completion::Published,
                    })
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let granted = ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_)));
                inflight
                    .remove(&ack.pkid)
                    .map(|request| LinkEvent::Completed {
                        request,
                        completion: Completion::Subscribed { granted },
                    })
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid)))
            | Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                if let Some(request) = submitted.lock().pop_front() {
                    trace!(target: "hub_remote::cloud", request, pkid, "packet sent");
                    inflight.insert(pkid, request);
                }
                None
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(LinkEvent::Disconnected { reason: None });
                return;
            }
            Ok(_) => None,
            Err(err) => {
                if connected.swap(false, Ordering::AcqRel) {
                    let _ = events.send(LinkEvent::Disconnected {
                        reason: Some(err.to_string()),
                    });
                    return;
                }
                if events
                    .send(LinkEvent::ConnectFailed {
                        reason: err.to_string(),
                    })
                    .is_err()
                {
                    return;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).is_err() {
                return;
            }
        }
    }
}
