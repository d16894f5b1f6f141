use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use metrics::{counter, gauge};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::handshake::HandshakeMessage;
use crate::ids::{matches_with_slack, parse_id, reconcile_id};
use crate::link::{GatewayInput, GatewayLink};
use crate::protocol::{
    GatewayReply, GatewayRequest, SetupBody, DEFAULT_PLUGIN, HEARTBEAT_TRANSACTION,
};
use crate::session::{BufferedOffer, BufferedTrickle, WebRtcSession};

const LOG: &str = "hub_remote::gateway";

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub plugin: String,
    pub request_timeout: Duration,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            plugin: DEFAULT_PLUGIN.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The gateway reported the session as timed out.
    GatewayTimeout,
    /// Create or attach failed or never got an answer.
    SetupFailed,
    /// The gateway socket went away.
    LinkClosed,
    /// Candidates arrived but no offer followed within the request timeout.
    NoOffer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A message for the remote peer behind `session_id`.
    Handshake {
        session_id: String,
        message: HandshakeMessage,
    },
    SessionClosed {
        session_id: String,
        reason: CloseReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Create,
    Attach,
    Offer,
    Trickle,
}

#[derive(Debug, Clone)]
struct PendingRequest {
    session_id: String,
    kind: RequestKind,
    /// Id the remote peer used; echoed back in the relayed ack or answer.
    reply_id: Option<String>,
    issued_at: Instant,
}

pub struct GatewayConnector<L> {
    link: L,
    settings: GatewaySettings,
    sessions: HashMap<String, WebRtcSession>,
    pending: HashMap<String, PendingRequest>,
    events: VecDeque<GatewayEvent>,
}

impl<L: GatewayLink> GatewayConnector<L> {
    pub fn new(link: L, settings: GatewaySettings) -> Self {
        Self {
            link,
            settings,
            sessions: HashMap::new(),
            pending: HashMap::new(),
            events: VecDeque::new(),
        }
    }

    pub fn session(&self, session_id: &str) -> Option<&WebRtcSession> {
        self.sessions.get(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn poll_event(&mut self) -> Option<GatewayEvent> {
        self.events.pop_front()
    }

    /// Route a signaling message from the remote peer into the gateway. Opens
    /// the socket first when needed.
    pub fn send_handshake(&mut self, session_id: &str, payload: &Value) {
        let message = match serde_json::from_value::<HandshakeMessage>(payload.clone()) {
            Ok(message) => message,
            Err(err) => {
                warn!(target: LOG, %session_id, error = %err, "unhandled handshake message");
                return;
            }
        };
        if !self.link.is_open() {
            if !self.sessions.is_empty() {
                // the previous connection died before its close notice was handled
                self.drop_sessions();
            }
            if let Err(err) = self.link.open() {
                warn!(target: LOG, error = %err, "gateway unavailable; dropping handshake");
                return;
            }
            info!(target: LOG, "connected to gateway");
        }

        match message {
            HandshakeMessage::Offer { id, jsep } => {
                let session = self
                    .sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| WebRtcSession::new(session_id));
                let renegotiation = session.offer.is_some();
                session.offer = Some(BufferedOffer { id, jsep });
                session.offer_sent = false;
                if renegotiation {
                    debug!(target: LOG, %session_id, "renegotiating session");
                    session.reset_gateway();
                    self.pending
                        .retain(|_, request| request.session_id != session_id);
                }
                self.update_session_gauge();
                self.create_session(session_id);
            }
            HandshakeMessage::Trickle { id, candidate } => {
                self.sessions
                    .entry(session_id.to_string())
                    .or_insert_with(|| WebRtcSession::new(session_id))
                    .trickles
                    .push_back(BufferedTrickle { id, candidate });
                self.update_session_gauge();
            }
            HandshakeMessage::Webrtcup { id } => {
                let Some(session) = self.sessions.get_mut(session_id) else {
                    warn!(target: LOG, %session_id, "webrtcup request for unknown session");
                    return;
                };
                if session.peer_connected {
                    self.events.push_back(GatewayEvent::Handshake {
                        session_id: session_id.to_string(),
                        message: HandshakeMessage::ack(id),
                    });
                } else {
                    session.pending_up_ack = Some(id);
                }
            }
            other => {
                warn!(target: LOG, %session_id, kind = other.kind(), "unexpected handshake message from peer");
                return;
            }
        }
        self.drain(session_id);
    }

    pub fn handle_input(&mut self, input: GatewayInput) {
        match input {
            GatewayInput::Frame(frame) => self.handle_frame(&frame),
            GatewayInput::Closed { generation } if generation != self.link.generation() => {
                debug!(target: LOG, generation, "ignoring close of a replaced connection");
            }
            GatewayInput::Closed { .. } => self.handle_closed(),
        }
    }

    pub fn handle_frame(&mut self, raw: &str) {
        let reply: GatewayReply = match serde_json::from_str(raw) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(target: LOG, error = %err, "cannot parse gateway frame");
                return;
            }
        };

        match reply.janus.as_str() {
            "timeout" => return self.on_session_timeout(&reply),
            "webrtcup" => return self.on_webrtc_up(&reply),
            _ => {}
        }

        let Some(transaction) = reply.transaction.clone() else {
            warn!(target: LOG, janus = %reply.janus, "gateway frame without transaction");
            return;
        };
        if transaction == HEARTBEAT_TRANSACTION {
            trace!(target: LOG, "heartbeat answered");
            return;
        }
        let Some(request) = self.pending.remove(&transaction) else {
            warn!(target: LOG, %transaction, janus = %reply.janus, "reply for unknown transaction");
            return;
        };
        let Some(session) = self.sessions.get(&request.session_id) else {
            debug!(target: LOG, session_id = %request.session_id, "reply for a session that is gone");
            return;
        };

        if request.kind != RequestKind::Create {
            let reported = reply.session_id.as_ref().and_then(parse_id);
            if let (Some(stored), Some(reported)) = (session.gateway_session, reported) {
                if !matches_with_slack(stored, reported) {
                    warn!(
                        target: LOG,
                        stored,
                        reported,
                        "reply session id does not match transaction"
                    );
                    self.pending.insert(transaction, request);
                    return;
                }
            }
        }

        if reply.janus == "error" {
            warn!(
                target: LOG,
                session_id = %request.session_id,
                kind = ?request.kind,
                reason = %reply.error_reason(),
                "gateway rejected request"
            );
        }

        match request.kind {
            RequestKind::Create => self.on_create_reply(request, &reply, raw),
            RequestKind::Attach => self.on_attach_reply(request, &reply, raw),
            RequestKind::Offer => self.on_offer_reply(transaction, request, &reply),
            RequestKind::Trickle => self.on_trickle_reply(transaction, request, &reply),
        }
    }

    /// The socket went away. Gateway-side sessions die with it.
    pub fn handle_closed(&mut self) {
        warn!(target: LOG, sessions = self.sessions.len(), "gateway connection lost");
        self.link.close();
        self.drop_sessions();
    }

    fn drop_sessions(&mut self) {
        self.pending.clear();
        let mut closed: Vec<String> = self.sessions.drain().map(|(id, _)| id).collect();
        closed.sort();
        for session_id in closed {
            self.events.push_back(GatewayEvent::SessionClosed {
                session_id,
                reason: CloseReason::LinkClosed,
            });
        }
        self.update_session_gauge();
    }

    /// Keep-alive ping; does nothing while the socket is closed.
    pub fn heartbeat(&mut self) {
        if !self.link.is_open() {
            return;
        }
        self.send(GatewayRequest::Ping {
            transaction: HEARTBEAT_TRANSACTION.to_string(),
        });
    }

    /// Fail requests the gateway never answered.
    pub fn expire(&mut self) {
        let now = Instant::now();
        let timeout = self.settings.request_timeout;
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, request)| now.saturating_duration_since(request.issued_at) >= timeout)
            .map(|(transaction, _)| transaction.clone())
            .collect();
        for transaction in expired {
            let Some(request) = self.pending.remove(&transaction) else {
                continue;
            };
            warn!(
                target: LOG,
                session_id = %request.session_id,
                kind = ?request.kind,
                "gateway request timed out"
            );
            match request.kind {
                RequestKind::Create | RequestKind::Attach => {
                    self.remove_session(&request.session_id, CloseReason::SetupFailed);
                }
                RequestKind::Offer | RequestKind::Trickle => {
                    self.release(&request.session_id, &transaction);
                }
            }
        }

        let mut idle: Vec<String> = self
            .sessions
            .values()
            .filter(|session| {
                session.offer.is_none()
                    && now.saturating_duration_since(session.created_at) >= timeout
            })
            .map(|session| session.id.clone())
            .collect();
        idle.sort();
        for session_id in idle {
            warn!(target: LOG, %session_id, "no offer arrived; dropping buffered candidates");
            self.remove_session(&session_id, CloseReason::NoOffer);
        }
    }

    fn send(&mut self, request: GatewayRequest) -> bool {
        let kind = request.kind();
        let line = match request.to_line() {
            Ok(line) => line,
            Err(err) => {
                warn!(target: LOG, error = %err, "failed to encode gateway request");
                return false;
            }
        };
        trace!(target: LOG, frame = %line, "sending");
        if kind != "ping" {
            counter!("hub_remote_gateway_requests_total", 1, "kind" => kind);
        }
        match self.link.send(line) {
            Ok(()) => true,
            Err(err) => {
                warn!(target: LOG, error = %err, kind, "failed to write to gateway");
                false
            }
        }
    }

    fn track(&mut self, session_id: &str, kind: RequestKind, reply_id: Option<String>) -> String {
        let transaction = Uuid::new_v4().to_string();
        self.pending.insert(
            transaction.clone(),
            PendingRequest {
                session_id: session_id.to_string(),
                kind,
                reply_id,
                issued_at: Instant::now(),
            },
        );
        transaction
    }

    fn create_session(&mut self, session_id: &str) {
        debug!(target: LOG, %session_id, "creating gateway session");
        let transaction = self.track(session_id, RequestKind::Create, None);
        self.send(GatewayRequest::Create { transaction });
    }

    fn attach(&mut self, session_id: &str, gateway_session: u64) {
        debug!(target: LOG, %session_id, gateway_session, "attaching plugin");
        let transaction = self.track(session_id, RequestKind::Attach, None);
        self.send(GatewayRequest::Attach {
            transaction,
            session_id: gateway_session,
            plugin: self.settings.plugin.clone(),
            opaque_id: format!("hub-remote-{}", Uuid::new_v4()),
        });
    }

    fn assigned_id(reply: &GatewayReply, raw: &str) -> Option<u64> {
        let parsed = reply.data_id().and_then(parse_id)?;
        Some(reconcile_id(raw, parsed))
    }

    fn on_create_reply(&mut self, request: PendingRequest, reply: &GatewayReply, raw: &str) {
        let assigned = match reply.janus.as_str() {
            "success" => Self::assigned_id(reply, raw),
            _ => None,
        };
        let Some(gateway_session) = assigned else {
            warn!(target: LOG, session_id = %request.session_id, "failed to create gateway session");
            self.remove_session(&request.session_id, CloseReason::SetupFailed);
            return;
        };
        if let Some(session) = self.sessions.get_mut(&request.session_id) {
            session.gateway_session = Some(gateway_session);
            debug!(target: LOG, %session, "gateway session established");
        }
        self.attach(&request.session_id, gateway_session);
    }

    fn on_attach_reply(&mut self, request: PendingRequest, reply: &GatewayReply, raw: &str) {
        let assigned = match reply.janus.as_str() {
            "success" => Self::assigned_id(reply, raw),
            _ => None,
        };
        let Some(handle) = assigned else {
            warn!(target: LOG, session_id = %request.session_id, "failed to attach gateway plugin");
            self.remove_session(&request.session_id, CloseReason::SetupFailed);
            return;
        };
        if let Some(session) = self.sessions.get_mut(&request.session_id) {
            session.handle = Some(handle);
            session.attached = true;
            debug!(target: LOG, %session, "gateway plugin attached");
        }
        self.drain(&request.session_id);
    }

    fn on_offer_reply(&mut self, transaction: String, request: PendingRequest, reply: &GatewayReply) {
        let session_id = request.session_id.clone();
        let reply_id = request.reply_id.clone().unwrap_or_default();
        match reply.janus.as_str() {
            "ack" => {
                self.relay(&session_id, HandshakeMessage::ack(reply_id));
                // the answer arrives later as an event on the same transaction
                self.pending.insert(transaction.clone(), request);
                self.release(&session_id, &transaction);
            }
            "event" => match reply.answer() {
                Some(jsep) => {
                    self.relay(
                        &session_id,
                        HandshakeMessage::Answer {
                            id: reply_id,
                            jsep: jsep.clone(),
                        },
                    );
                    self.release(&session_id, &transaction);
                }
                None => {
                    debug!(target: LOG, %session_id, "plugin event without answer");
                    self.pending.insert(transaction, request);
                }
            },
            "error" => self.release(&session_id, &transaction),
            other => {
                warn!(target: LOG, %session_id, janus = %other, "unhandled reply to offer");
                self.pending.insert(transaction, request);
            }
        }
    }

    fn on_trickle_reply(&mut self, transaction: String, request: PendingRequest, reply: &GatewayReply) {
        if reply.janus == "ack" {
            self.relay(
                &request.session_id,
                HandshakeMessage::ack(request.reply_id.clone().unwrap_or_default()),
            );
        } else if reply.janus != "error" {
            warn!(
                target: LOG,
                session_id = %request.session_id,
                janus = %reply.janus,
                "unhandled reply to trickle"
            );
        }
        self.release(&request.session_id, &transaction);
    }

    fn on_session_timeout(&mut self, reply: &GatewayReply) {
        let Some(reported) = reply.session_id.as_ref().and_then(parse_id) else {
            warn!(target: LOG, "timeout event without session id");
            return;
        };
        match self.find_by_gateway_id(reported) {
            Some(session_id) => {
                info!(target: LOG, %session_id, "gateway session timed out");
                self.remove_session(&session_id, CloseReason::GatewayTimeout);
            }
            None => warn!(target: LOG, reported, "timeout event for unknown session"),
        }
    }

    fn on_webrtc_up(&mut self, reply: &GatewayReply) {
        let Some(reported) = reply.session_id.as_ref().and_then(parse_id) else {
            warn!(target: LOG, "webrtcup event without session id");
            return;
        };
        let Some(session_id) = self.find_by_gateway_id(reported) else {
            warn!(target: LOG, reported, "webrtcup event for unknown session");
            return;
        };
        let pending_ack = self.sessions.get_mut(&session_id).and_then(|session| {
            session.peer_connected = true;
            session.pending_up_ack.take()
        });
        info!(target: LOG, %session_id, "peer connection is up");
        if let Some(id) = pending_ack {
            self.relay(&session_id, HandshakeMessage::ack(id));
        }
    }

    fn find_by_gateway_id(&self, reported: u64) -> Option<String> {
        let exact = self
            .sessions
            .values()
            .find(|session| session.gateway_session == Some(reported));
        exact
            .or_else(|| {
                self.sessions.values().find(|session| {
                    session
                        .gateway_session
                        .is_some_and(|stored| matches_with_slack(stored, reported))
                })
            })
            .map(|session| session.id.clone())
    }

    /// Send the next piece of work for a session: the offer first, then one
    /// trickle per acknowledgement.
    fn drain(&mut self, session_id: &str) {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return;
        };
        if session.in_flight.is_some() {
            return;
        }
        let Some((gateway_session, handle)) = session.gateway_ids() else {
            return;
        };

        if !session.offer_sent {
            let Some(offer) = session.offer.clone() else {
                return;
            };
            session.offer_sent = true;
            let transaction = self.track(session_id, RequestKind::Offer, Some(offer.id));
            self.mark_in_flight(session_id, &transaction);
            debug!(target: LOG, %session_id, "sending offer");
            self.send(GatewayRequest::Message {
                transaction,
                session_id: gateway_session,
                handle_id: handle,
                body: SetupBody::setup(),
                jsep: offer.jsep,
            });
            return;
        }

        let Some(trickle) = session.trickles.pop_front() else {
            return;
        };
        let transaction = self.track(session_id, RequestKind::Trickle, Some(trickle.id));
        self.mark_in_flight(session_id, &transaction);
        trace!(target: LOG, %session_id, "sending trickle candidate");
        self.send(GatewayRequest::Trickle {
            transaction,
            session_id: gateway_session,
            handle_id: handle,
            candidate: trickle.candidate,
        });
    }

    fn mark_in_flight(&mut self, session_id: &str, transaction: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.in_flight = Some(transaction.to_string());
        }
    }

    /// Free the session's in-flight slot if `transaction` holds it, then drain.
    fn release(&mut self, session_id: &str, transaction: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            if session.in_flight.as_deref() == Some(transaction) {
                session.in_flight = None;
            }
        }
        self.drain(session_id);
    }

    fn relay(&mut self, session_id: &str, message: HandshakeMessage) {
        self.events.push_back(GatewayEvent::Handshake {
            session_id: session_id.to_string(),
            message,
        });
    }

    fn remove_session(&mut self, session_id: &str, reason: CloseReason) {
        if self.sessions.remove(session_id).is_none() {
            return;
        }
        self.pending
            .retain(|_, request| request.session_id != session_id);
        self.update_session_gauge();
        self.events.push_back(GatewayEvent::SessionClosed {
            session_id: session_id.to_string(),
            reason,
        });
    }

    fn update_session_gauge(&self) {
        gauge!("hub_remote_gateway_sessions", self.sessions.len() as f64);
    }
}
