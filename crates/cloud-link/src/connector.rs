//! Cloud connector state machine.
//!
//! The connector owns no I/O. Callers drive it with [`CloudConnector::handle_link_event`]
//! and [`CloudConnector::expire`], and drain [`CloudEvent`]s with
//! [`CloudConnector::poll_event`].

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use transport_bus::topic_matches;
use uuid::Uuid;

use crate::dedup::DedupFilter;
use crate::link::{BrokerLink, BrokerTarget, Completion, LinkEvent, RequestId};
use crate::messages::{
    self, CreateDevice, CreateDeviceResponse, GetUsers, NewEndpointNotice, NotifyResponse,
    PairRequest, PairResponse, PostName, ProxyRequest, PushEndpointEntry, PushNotification,
    SignalHeader, StatusResponse, TurnRequest, TurnResponse, UsersResponse,
};
use crate::packets::{PacketKind, PacketTracker};
use crate::pairing::PairingLedger;
use crate::reconnect::FlapDetector;
use crate::store::IdentityStore;
use crate::topics::{self, InboundTopic, Topics};
use crate::turn::TurnCache;

const LOG: &str = "hub_remote::cloud";
const TRAFFIC: &str = "hub_remote::cloud::traffic";

#[derive(Debug, Clone)]
pub struct CloudSettings {
    pub pairing_timeout: Duration,
    pub dedup_ttl: Duration,
    pub dedup_capacity: usize,
    pub flap_window: Duration,
    pub flap_threshold: u32,
    pub packet_ttl: Duration,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            pairing_timeout: Duration::from_secs(30),
            dedup_ttl: Duration::from_secs(60),
            dedup_capacity: 1024,
            flap_window: Duration::from_secs(60),
            flap_threshold: 5,
            packet_ttl: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected; registration topic subscribed, waiting for the broker to
    /// confirm before publishing the registration request.
    ConnectedUnregistered,
    Registering,
    /// Freshly registered; the broker only applies device policies to a new
    /// connection, so this one is being closed.
    PendingPostRegistrationReconnect,
    SettingUpSubscriptions,
    Ready,
}

impl ConnectionState {
    fn in_setup(self) -> bool {
        matches!(
            self,
            ConnectionState::ConnectedUnregistered
                | ConnectionState::Registering
                | ConnectionState::SettingUpSubscriptions
        )
    }

    fn can_publish(self) -> bool {
        self.in_setup() || self == ConnectionState::Ready
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    Paired,
    Rejected { status: u16, message: String },
    TimedOut,
    /// The connection was lost and registration has to start over.
    Aborted,
    NotConnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEndpoint {
    pub user_id: String,
    pub endpoint_id: String,
    pub display_name: String,
}

impl PushEndpoint {
    fn from_entry(user_id: &str, entry: PushEndpointEntry) -> Self {
        Self {
            user_id: user_id.to_string(),
            endpoint_id: entry.endpoint_id,
            display_name: entry.display_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloudEvent {
    Connected,
    Disconnected,
    PairingFinished {
        transaction: u64,
        user_id: String,
        outcome: PairingOutcome,
    },
    /// Signaling payload from a remote client. `session_id` is the topic it
    /// arrived on.
    HandshakeReceived { session_id: String, payload: Value },
    ProxyConnectionRequested { token: String, nonce: String },
    PushEndpointsUpdated(Vec<PushEndpoint>),
    PushEndpointAdded(PushEndpoint),
    PushNotificationSent { transaction: u64, status: u16 },
    TurnCredentials(Option<Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SeenKey {
    Signal { id: String, kind: String },
    Proxy { topic: String, token: String, timestamp: String },
}

pub struct CloudConnector<L, S> {
    link: L,
    store: S,
    settings: CloudSettings,
    topics: Topics,
    device_name: String,
    registration_id: Option<String>,
    target: Option<BrokerTarget>,
    state: ConnectionState,
    should_reconnect: bool,
    disconnect_requested: bool,
    next_transaction: u64,
    flaps: FlapDetector,
    pairings: PairingLedger,
    packets: PacketTracker,
    seen: DedupFilter<SeenKey>,
    subscriptions: BTreeSet<String>,
    paired_users: BTreeSet<String>,
    turn: TurnCache,
    events: VecDeque<CloudEvent>,
}

impl<L: BrokerLink, S: IdentityStore> CloudConnector<L, S> {
    pub fn new(
        link: L,
        store: S,
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        settings: CloudSettings,
    ) -> Self {
        let flaps = FlapDetector::new(settings.flap_window, settings.flap_threshold);
        let seen = DedupFilter::new(settings.dedup_ttl, settings.dedup_capacity);
        Self {
            link,
            store,
            topics: Topics::new(device_id),
            device_name: device_name.into(),
            registration_id: None,
            target: None,
            state: ConnectionState::Disconnected,
            should_reconnect: false,
            disconnect_requested: false,
            next_transaction: 0,
            flaps,
            pairings: PairingLedger::default(),
            packets: PacketTracker::default(),
            seen,
            subscriptions: BTreeSet::new(),
            paired_users: BTreeSet::new(),
            turn: TurnCache::default(),
            settings,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn device_id(&self) -> &str {
        self.topics.device_id()
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn paired_users(&self) -> impl Iterator<Item = &str> {
        self.paired_users.iter().map(String::as_str)
    }

    pub fn pending_pairings(&self) -> usize {
        self.pairings.len()
    }

    pub fn tracked_packets(&self) -> usize {
        self.packets.len()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn poll_event(&mut self) -> Option<CloudEvent> {
        self.events.pop_front()
    }

    /// Start (or retarget) the broker session and keep it up until
    /// [`disconnect`](Self::disconnect) is called.
    pub fn connect(&mut self, target: BrokerTarget) {
        self.should_reconnect = true;
        self.target = Some(target);
        if self.state != ConnectionState::Disconnected {
            info!(target: LOG, state = ?self.state, "restarting cloud session");
            self.request_disconnect();
            return;
        }
        self.open();
    }

    pub fn disconnect(&mut self) {
        self.should_reconnect = false;
        if self.state == ConnectionState::Disconnected {
            return;
        }
        info!(target: LOG, "disconnecting from cloud");
        self.request_disconnect();
    }

    /// Ask the cloud to pair `user_id`. The result arrives as
    /// [`CloudEvent::PairingFinished`] carrying the returned transaction id.
    pub fn pair(&mut self, id_token: &str, user_id: &str) -> u64 {
        let transaction = self.next_transaction();
        if !self.is_ready() {
            warn!(target: LOG, %user_id, "cannot pair while the cloud is not connected");
            self.finish_pairing(transaction, user_id.to_string(), PairingOutcome::NotConnected);
            return transaction;
        }
        let request = PairRequest {
            id_token,
            user_id,
            id: transaction,
            timestamp: messages::unix_millis(),
        };
        let topic = self.topics.pair();
        if self.publish(&topic, &request).is_none() {
            self.finish_pairing(transaction, user_id.to_string(), PairingOutcome::NotConnected);
            return transaction;
        }
        info!(target: LOG, %user_id, transaction, "pairing requested");
        self.pairings.insert(transaction, user_id, Instant::now());
        transaction
    }

    pub fn set_device_name(&mut self, name: &str) {
        if self.device_name == name {
            return;
        }
        self.device_name = name.to_string();
        self.store.set_synced_name(None);
        if self.is_ready() {
            self.post_name();
        }
    }

    /// Publish a signaling reply for `session_id`.
    pub fn send_handshake(&mut self, session_id: &str, payload: &Value) -> Option<RequestId> {
        if !self.is_ready() {
            warn!(target: LOG, %session_id, "dropping signaling reply; cloud not connected");
            return None;
        }
        let request = self.publish(&topics::reply_topic(session_id), payload)?;
        counter!("hub_remote_handshakes_out_total", 1);
        Some(request)
    }

    pub fn send_push_notification(
        &mut self,
        endpoint_id: &str,
        title: &str,
        body: &str,
    ) -> Option<u64> {
        if !self.is_ready() {
            warn!(target: LOG, %endpoint_id, "cannot send push notification while disconnected");
            return None;
        }
        let transaction = self.next_transaction();
        let notification = PushNotification {
            command: messages::PUSH_NOTIFICATION,
            id: transaction,
            title,
            body,
            timestamp: messages::unix_millis(),
        };
        let topic = self.topics.notify_user(endpoint_id);
        self.publish(&topic, &notification)?;
        Some(transaction)
    }

    /// Emits [`CloudEvent::TurnCredentials`], from cache when still valid.
    pub fn request_turn_credentials(&mut self) {
        if !self.is_ready() {
            self.events.push_back(CloudEvent::TurnCredentials(None));
            return;
        }
        if let Some(credentials) = self.turn.valid(Instant::now()) {
            self.events
                .push_back(CloudEvent::TurnCredentials(Some(credentials)));
            return;
        }
        self.fetch_turn_credentials();
    }

    pub fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => self.on_connected(),
            LinkEvent::ConnectFailed { reason } => {
                counter!("hub_remote_cloud_connect_failures_total", 1);
                warn!(target: LOG, %reason, "cloud connect attempt failed");
            }
            LinkEvent::Disconnected { reason } => self.on_disconnected(reason),
            LinkEvent::Completed {
                request,
                completion,
            } => self.on_completed(request, completion),
            LinkEvent::Message { topic, payload } => self.on_message(&topic, &payload),
        }
    }

    /// Housekeeping: pairing timeouts, stale packets, dedup pruning and TURN
    /// refresh. Call about once a second.
    pub fn expire(&mut self) {
        let now = Instant::now();
        for (transaction, user_id) in self.pairings.expire(now, self.settings.pairing_timeout) {
            warn!(target: LOG, %user_id, transaction, "pairing timed out");
            self.finish_pairing(transaction, user_id, PairingOutcome::TimedOut);
        }
        let stale = self.packets.expire(now, self.settings.packet_ttl);
        if stale > 0 {
            debug!(target: LOG, stale, "dropped unacknowledged packets");
        }
        self.seen.prune(now);
        if self.turn.take_refresh_due(now) && self.is_ready() {
            debug!(target: LOG, "refreshing TURN credentials");
            self.fetch_turn_credentials();
        }
    }

    fn next_transaction(&mut self) -> u64 {
        self.next_transaction += 1;
        self.next_transaction
    }

    fn open(&mut self) {
        let Some(target) = self.target.clone() else {
            return;
        };
        self.state = ConnectionState::Connecting;
        self.disconnect_requested = false;
        self.subscriptions.clear();
        counter!("hub_remote_cloud_connects_total", 1);
        info!(
            target: LOG,
            host = %target.host,
            port = target.port,
            device_id = %self.topics.device_id(),
            "connecting to cloud"
        );
        if let Err(err) = self.link.connect(&target) {
            warn!(target: LOG, error = %err, "failed to start cloud session");
            self.state = ConnectionState::Disconnected;
        }
    }

    fn request_disconnect(&mut self) {
        self.disconnect_requested = true;
        if let Err(err) = self.link.disconnect() {
            debug!(target: LOG, error = %err, "link had no session to close");
            self.on_disconnected(None);
        }
    }

    fn publish<T: Serialize + ?Sized>(&mut self, topic: &str, message: &T) -> Option<RequestId> {
        if !self.state.can_publish() {
            warn!(target: LOG, %topic, state = ?self.state, "not connected; dropping publish");
            return None;
        }
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: LOG, %topic, error = %err, "failed to encode cloud message");
                return None;
            }
        };
        trace!(
            target: TRAFFIC,
            %topic,
            payload = %String::from_utf8_lossy(&payload),
            "publish"
        );
        match self.link.publish(topic, Bytes::from(payload)) {
            Ok(request) => {
                self.packets.track(
                    request,
                    PacketKind::Publish {
                        topic: topic.to_string(),
                    },
                    Instant::now(),
                );
                Some(request)
            }
            Err(err) => {
                warn!(target: LOG, %topic, error = %err, "publish failed");
                None
            }
        }
    }

    fn subscribe(&mut self, filters: Vec<String>) {
        let fresh: Vec<String> = filters
            .into_iter()
            .filter(|filter| !self.subscriptions.contains(filter))
            .collect();
        if fresh.is_empty() {
            return;
        }
        match self.link.subscribe(&fresh) {
            Ok(request) => {
                debug!(target: LOG, filters = ?fresh, request, "subscribing");
                self.subscriptions.extend(fresh.iter().cloned());
                self.packets.track(
                    request,
                    PacketKind::Subscribe { filters: fresh },
                    Instant::now(),
                );
            }
            Err(err) => warn!(target: LOG, filters = ?fresh, error = %err, "subscribe failed"),
        }
    }

    fn on_connected(&mut self) {
        if self.disconnect_requested || self.state != ConnectionState::Connecting {
            debug!(target: LOG, state = ?self.state, "ignoring stale connect notification");
            return;
        }
        info!(target: LOG, registered = self.store.registered(), "connected to cloud");
        if self.store.registered() {
            self.setup_subscriptions();
        } else {
            self.register();
        }
    }

    fn register(&mut self) {
        let ephemeral = Uuid::new_v4().to_string();
        info!(target: LOG, registration_id = %ephemeral, "registering device");
        self.state = ConnectionState::ConnectedUnregistered;
        let filter = self.topics.registration_response(&ephemeral);
        self.registration_id = Some(ephemeral);
        self.subscribe(vec![filter]);
    }

    fn setup_subscriptions(&mut self) {
        self.state = ConnectionState::SettingUpSubscriptions;
        let filters = self.topics.setup_filters();
        self.subscribe(filters);
        self.fetch_pairings();
    }

    fn fetch_pairings(&mut self) {
        let request = GetUsers {
            command: messages::GET_USERS,
            id: self.next_transaction(),
            timestamp: messages::unix_millis(),
        };
        let topic = self.topics.users();
        self.publish(&topic, &request);
    }

    fn post_name(&mut self) {
        let name = self.device_name.clone();
        let request = PostName {
            command: messages::POST_NAME,
            name: &name,
            id: self.next_transaction(),
            timestamp: messages::unix_secs(),
        };
        let topic = self.topics.name();
        if self.publish(&topic, &request).is_some() {
            debug!(target: LOG, %name, "publishing device name");
        }
    }

    fn fetch_turn_credentials(&mut self) {
        let id = Uuid::new_v4().to_string();
        let request = TurnRequest {
            command: messages::GET_TURN_CREDENTIALS,
            id: &id,
            timestamp: messages::unix_millis(),
        };
        let topic = self.topics.turn();
        if self.publish(&topic, &request).is_none() {
            self.events.push_back(CloudEvent::TurnCredentials(None));
        }
    }

    fn on_completed(&mut self, request: RequestId, completion: Completion) {
        let Some(pending) = self.packets.complete(request) else {
            debug!(target: LOG, request, "acknowledgement for unknown request");
            return;
        };
        match (pending.kind, completion) {
            (PacketKind::Subscribe { filters }, Completion::Subscribed { granted }) => {
                if !granted {
                    warn!(target: LOG, ?filters, "broker refused subscription");
                    for filter in &filters {
                        self.subscriptions.remove(filter);
                    }
                    return;
                }
                let registration = self
                    .registration_id
                    .as_deref()
                    .map(|id| self.topics.registration_response(id));
                let awaiting_registration = self.state == ConnectionState::ConnectedUnregistered
                    && !self.store.registered()
                    && registration
                        .as_ref()
                        .is_some_and(|topic| filters.contains(topic));
                if awaiting_registration {
                    self.publish_registration();
                }
            }
            (PacketKind::Publish { topic }, Completion::Published) => {
                trace!(target: LOG, %topic, request, "publish acknowledged");
            }
            (kind, completion) => {
                debug!(target: LOG, ?kind, ?completion, "mismatched acknowledgement");
            }
        }
    }

    fn publish_registration(&mut self) {
        let Some(ephemeral) = self.registration_id.clone() else {
            return;
        };
        let device_id = self.topics.device_id().to_string();
        let request = CreateDevice {
            id: &ephemeral,
            uuid: &device_id,
        };
        if self.publish(topics::CREATE_DEVICE, &request).is_some() {
            self.state = ConnectionState::Registering;
        }
    }

    fn on_disconnected(&mut self, reason: Option<String>) {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Disconnected);
        let requested = std::mem::take(&mut self.disconnect_requested);
        self.subscriptions.clear();
        self.registration_id = None;
        let reaped = self.packets.reap_all();
        if reaped > 0 {
            debug!(target: LOG, reaped, "discarded unacknowledged packets");
        }

        match previous {
            ConnectionState::Disconnected => {
                debug!(target: LOG, "disconnect while already disconnected");
                return;
            }
            ConnectionState::Connecting => {
                debug!(target: LOG, ?reason, "session closed before connecting");
            }
            ConnectionState::PendingPostRegistrationReconnect => {
                info!(target: LOG, "reconnecting to apply device registration");
            }
            ConnectionState::Ready if requested => {
                info!(target: LOG, "disconnected from cloud");
                self.turn.clear();
                self.events.push_back(CloudEvent::Disconnected);
            }
            ConnectionState::Ready => {
                counter!("hub_remote_cloud_drops_total", 1);
                warn!(target: LOG, ?reason, "disconnected from cloud");
                self.turn.clear();
                self.events.push_back(CloudEvent::Disconnected);
                if self.flaps.record_drop(Instant::now()) {
                    warn!(target: LOG, "connection keeps dropping; registering again");
                    self.force_reregistration();
                }
            }
            state if requested => {
                debug!(target: LOG, ?state, "session closed during setup");
            }
            state => {
                debug_assert!(state.in_setup());
                warn!(target: LOG, ?state, ?reason, "connection lost during setup; registering again");
                self.force_reregistration();
            }
        }

        if self.should_reconnect {
            self.open();
        }
    }

    fn force_reregistration(&mut self) {
        counter!("hub_remote_cloud_reregistrations_total", 1);
        self.store.set_registered(false);
        self.store.set_synced_name(None);
        for (transaction, user_id) in self.pairings.drain() {
            self.finish_pairing(transaction, user_id, PairingOutcome::Aborted);
        }
    }

    fn finish_pairing(&mut self, transaction: u64, user_id: String, outcome: PairingOutcome) {
        let label = match &outcome {
            PairingOutcome::Paired => "paired",
            PairingOutcome::Rejected { .. } => "rejected",
            PairingOutcome::TimedOut => "timed_out",
            PairingOutcome::Aborted => "aborted",
            PairingOutcome::NotConnected => "not_connected",
        };
        counter!("hub_remote_cloud_pairings_total", 1, "outcome" => label);
        self.events.push_back(CloudEvent::PairingFinished {
            transaction,
            user_id,
            outcome,
        });
    }

    fn on_message(&mut self, topic: &str, payload: &[u8]) {
        trace!(
            target: TRAFFIC,
            %topic,
            payload = %String::from_utf8_lossy(payload),
            "received"
        );
        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(err) => {
                warn!(target: LOG, %topic, error = %err, "dropping unparsable cloud message");
                return;
            }
        };

        match self.topics.classify(topic) {
            InboundTopic::Registration(ephemeral) => self.on_registration_response(ephemeral, value),
            InboundTopic::UsersResponse => self.on_users(value),
            InboundTopic::NameResponse => self.on_name_response(value),
            InboundTopic::PairResponse => self.on_pair_response(value),
            InboundTopic::NotifyResponse => self.on_notify_response(value),
            InboundTopic::NotifyEndpoint => self.on_new_endpoint(value),
            InboundTopic::TurnResponse => self.on_turn_response(value),
            InboundTopic::OwnReply => {}
            InboundTopic::Proxy { user } if self.accepts_user_topic(user, topic) => {
                self.on_proxy_request(topic, value)
            }
            InboundTopic::UserSignal { user } if self.accepts_user_topic(user, topic) => {
                self.on_signal(topic, value)
            }
            _ => warn!(target: LOG, %topic, "unhandled cloud message"),
        }
    }

    fn accepts_user_topic(&self, user: &str, topic: &str) -> bool {
        self.paired_users.contains(user)
            || self
                .subscriptions
                .iter()
                .any(|filter| topic_matches(filter, topic))
    }

    fn on_registration_response(&mut self, ephemeral: &str, value: Value) {
        if self.registration_id.as_deref() != Some(ephemeral) {
            debug!(target: LOG, %ephemeral, "ignoring response for another registration");
            return;
        }
        let Some(response) = parse::<CreateDeviceResponse>("registration response", value) else {
            return;
        };
        match response.result.code {
            201 => {
                info!(target: LOG, "device registered; reconnecting");
                self.store.set_registered(true);
                self.registration_id = None;
                self.state = ConnectionState::PendingPostRegistrationReconnect;
                self.request_disconnect();
            }
            200 => {
                info!(target: LOG, "device already registered");
                self.store.set_registered(true);
                self.registration_id = None;
                self.setup_subscriptions();
            }
            code => {
                warn!(
                    target: LOG,
                    code,
                    message = %response.result.message,
                    "cloud rejected device registration"
                );
                self.state = ConnectionState::ConnectedUnregistered;
            }
        }
    }

    fn on_users(&mut self, value: Value) {
        let Some(response) = parse::<UsersResponse>("users response", value) else {
            return;
        };
        info!(target: LOG, users = response.users.len(), "paired users received");
        self.paired_users = response.users.iter().cloned().collect();
        let filters = response
            .users
            .iter()
            .map(|user| self.topics.user_tree(user))
            .collect();
        self.subscribe(filters);

        if self.store.synced_name().as_deref() != Some(self.device_name.as_str()) {
            self.post_name();
        }

        let endpoints: Vec<PushEndpoint> = response
            .push_endpoints
            .into_iter()
            .flat_map(|by_user| by_user.into_iter())
            .flat_map(|(user_id, entries)| {
                entries
                    .into_iter()
                    .map(move |entry| PushEndpoint::from_entry(&user_id, entry))
            })
            .collect();
        self.events
            .push_back(CloudEvent::PushEndpointsUpdated(endpoints));

        if self.state == ConnectionState::SettingUpSubscriptions {
            self.state = ConnectionState::Ready;
            info!(target: LOG, "cloud connection ready");
            self.events.push_back(CloudEvent::Connected);
            self.request_turn_credentials();
        }
    }

    fn on_name_response(&mut self, value: Value) {
        let Some(response) = parse::<StatusResponse>("name response", value) else {
            return;
        };
        if response.status == 200 {
            debug!(target: LOG, name = %self.device_name, "device name synced");
            let name = self.device_name.clone();
            self.store.set_synced_name(Some(&name));
        } else {
            warn!(target: LOG, status = response.status, "cloud rejected device name");
        }
    }

    fn on_pair_response(&mut self, value: Value) {
        let Some(response) = parse::<PairResponse>("pairing response", value) else {
            return;
        };
        let Some(user_id) = self.pairings.take(response.id) else {
            warn!(target: LOG, transaction = response.id, "pairing response without a request");
            return;
        };
        if response.status == 200 {
            info!(target: LOG, %user_id, "user paired");
            self.finish_pairing(response.id, user_id, PairingOutcome::Paired);
            self.fetch_pairings();
        } else {
            warn!(
                target: LOG,
                %user_id,
                status = response.status,
                message = %response.result.message,
                "pairing rejected"
            );
            self.finish_pairing(
                response.id,
                user_id,
                PairingOutcome::Rejected {
                    status: response.status,
                    message: response.result.message,
                },
            );
        }
    }

    fn on_notify_response(&mut self, value: Value) {
        let Some(response) = parse::<NotifyResponse>("notification response", value) else {
            return;
        };
        if response.status != 200 {
            warn!(
                target: LOG,
                transaction = response.id,
                status = response.status,
                message = %response.message,
                "push notification failed"
            );
        }
        self.events.push_back(CloudEvent::PushNotificationSent {
            transaction: response.id,
            status: response.status,
        });
    }

    fn on_new_endpoint(&mut self, value: Value) {
        let Some(notice) = parse::<NewEndpointNotice>("endpoint notice", value) else {
            return;
        };
        for (user_id, entry) in notice.endpoints {
            let endpoint = PushEndpoint::from_entry(&user_id, entry);
            debug!(target: LOG, user_id = %endpoint.user_id, endpoint = %endpoint.endpoint_id, "push endpoint added");
            self.events.push_back(CloudEvent::PushEndpointAdded(endpoint));
        }
    }

    fn on_turn_response(&mut self, value: Value) {
        let Some(response) = parse::<TurnResponse>("TURN response", value) else {
            return;
        };
        match response.credentials {
            Some(credentials) if response.result.code == 201 => {
                self.turn.store(credentials.clone(), Instant::now());
                self.events
                    .push_back(CloudEvent::TurnCredentials(Some(credentials)));
            }
            _ => {
                warn!(
                    target: LOG,
                    code = response.result.code,
                    message = %response.result.message,
                    "TURN credential request failed"
                );
                self.events.push_back(CloudEvent::TurnCredentials(None));
            }
        }
    }

    fn on_signal(&mut self, topic: &str, value: Value) {
        let Ok(header) = serde_json::from_value::<SignalHeader>(value.clone()) else {
            warn!(target: LOG, %topic, "signaling message without id or type");
            return;
        };
        let key = SeenKey::Signal {
            id: header.id.0,
            kind: header.kind,
        };
        if !self.seen.insert(key, Instant::now()) {
            counter!("hub_remote_handshake_duplicates_total", 1);
            debug!(target: LOG, %topic, "dropping duplicate signaling message");
            return;
        }
        counter!("hub_remote_handshakes_in_total", 1);
        self.events.push_back(CloudEvent::HandshakeReceived {
            session_id: topic.to_string(),
            payload: value,
        });
    }

    fn on_proxy_request(&mut self, topic: &str, value: Value) {
        let Some(request) = parse::<ProxyRequest>("proxy request", value) else {
            return;
        };
        let key = SeenKey::Proxy {
            topic: topic.to_string(),
            token: request.token.clone(),
            timestamp: request.timestamp.0.clone(),
        };
        if !self.seen.insert(key, Instant::now()) {
            counter!("hub_remote_handshake_duplicates_total", 1);
            debug!(target: LOG, %topic, "dropping duplicate proxy request");
            return;
        }
        info!(target: LOG, %topic, "proxy connection requested");
        self.events.push_back(CloudEvent::ProxyConnectionRequested {
            token: request.token,
            nonce: request.timestamp.0,
        });
    }
}

fn parse<T: DeserializeOwned>(what: &str, value: Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(target: LOG, error = %err, "malformed {what}");
            None
        }
    }
}
