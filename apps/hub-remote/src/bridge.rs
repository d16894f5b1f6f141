//! Routes signaling between the cloud and the local gateway and decides when
//! remote access runs.
//!
//! [`RemoteAccessBridge`] owns both connectors. Handshakes from remote users
//! are passed into the gateway unchanged; the gateway's answers and acks go
//! back to the user's reply topic. The bridge connects the cloud only when it
//! is enabled, fully configured and the network is up.

use std::collections::HashMap;

use cloud_link::{
    BrokerLink, CloudConnector, CloudEvent, ConnectionState, IdentityStore, LinkEvent,
    PairingOutcome, PushEndpoint,
};
use gateway_signaling::{GatewayConnector, GatewayEvent, GatewayInput, GatewayLink};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, RemoteAccessConfig};
use crate::network::NetworkState;

const LOG: &str = "hub_remote::bridge";
const NOTICE_CAPACITY: usize = 64;

/// Cloud availability as reported to the rest of the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudConnectionState {
    Disabled,
    Unconfigured,
    Connecting,
    Connected,
}

#[derive(Debug)]
pub enum BridgeCommand {
    Pair {
        id_token: String,
        user_id: String,
        reply: oneshot::Sender<PairingOutcome>,
    },
    SetDeviceName(String),
    SetEnabled(bool),
    SendPushNotification {
        endpoint_id: String,
        title: String,
        body: String,
    },
    RequestTurnCredentials,
    Shutdown,
}

/// Cloud events that are not signaling, for whoever else cares.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeNotice {
    PairingFinished {
        user_id: String,
        outcome: PairingOutcome,
    },
    PushEndpointsUpdated(Vec<PushEndpoint>),
    PushEndpointAdded(PushEndpoint),
    PushNotificationSent {
        transaction: u64,
        status: u16,
    },
    TurnCredentials(Option<Value>),
    ProxyConnectionRequested {
        token: String,
        nonce: String,
    },
}

/// Cloneable front end to a running event loop.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    commands: mpsc::UnboundedSender<BridgeCommand>,
    state: watch::Receiver<CloudConnectionState>,
    notices: broadcast::Sender<BridgeNotice>,
}

impl BridgeHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<BridgeCommand>,
        state: watch::Receiver<CloudConnectionState>,
        notices: broadcast::Sender<BridgeNotice>,
    ) -> Self {
        Self {
            commands,
            state,
            notices,
        }
    }

    /// Pair a user and wait for the cloud's verdict.
    pub async fn pair(&self, id_token: &str, user_id: &str) -> PairingOutcome {
        let (reply, outcome) = oneshot::channel();
        let command = BridgeCommand::Pair {
            id_token: id_token.to_string(),
            user_id: user_id.to_string(),
            reply,
        };
        if self.commands.send(command).is_err() {
            return PairingOutcome::NotConnected;
        }
        outcome.await.unwrap_or(PairingOutcome::Aborted)
    }

    pub fn set_device_name(&self, name: &str) -> bool {
        self.send(BridgeCommand::SetDeviceName(name.to_string()))
    }

    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.send(BridgeCommand::SetEnabled(enabled))
    }

    pub fn send_push_notification(&self, endpoint_id: &str, title: &str, body: &str) -> bool {
        self.send(BridgeCommand::SendPushNotification {
            endpoint_id: endpoint_id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        })
    }

    pub fn request_turn_credentials(&self) -> bool {
        self.send(BridgeCommand::RequestTurnCredentials)
    }

    pub fn shutdown(&self) -> bool {
        self.send(BridgeCommand::Shutdown)
    }

    pub fn state(&self) -> CloudConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CloudConnectionState> {
        self.state.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<BridgeNotice> {
        self.notices.subscribe()
    }

    fn send(&self, command: BridgeCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

pub struct RemoteAccessBridge<L, S, G> {
    config: RemoteAccessConfig,
    cloud: CloudConnector<L, S>,
    gateway: GatewayConnector<G>,
    enabled: bool,
    configured: bool,
    network: NetworkState,
    /// A disconnect we asked for has not completed yet.
    stopping: bool,
    pairings: HashMap<u64, oneshot::Sender<PairingOutcome>>,
    state: watch::Sender<CloudConnectionState>,
    notices: broadcast::Sender<BridgeNotice>,
}

impl<L, S, G> RemoteAccessBridge<L, S, G>
where
    L: BrokerLink,
    S: IdentityStore,
    G: GatewayLink,
{
    pub fn new(config: RemoteAccessConfig, cloud_link: L, store: S, gateway_link: G) -> Self {
        let cloud = CloudConnector::new(
            cloud_link,
            store,
            config.device_id.clone().unwrap_or_default(),
            config.device_name.clone(),
            config.cloud_settings(),
        );
        let gateway = GatewayConnector::new(gateway_link, config.gateway_settings());
        let initial = if config.cloud_enabled {
            CloudConnectionState::Unconfigured
        } else {
            CloudConnectionState::Disabled
        };
        let (state, _) = watch::channel(initial);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            enabled: config.cloud_enabled,
            config,
            cloud,
            gateway,
            configured: false,
            network: NetworkState::Offline,
            stopping: false,
            pairings: HashMap::new(),
            state,
            notices,
        }
    }

    pub fn handle(&self, commands: mpsc::UnboundedSender<BridgeCommand>) -> BridgeHandle {
        BridgeHandle::new(commands, self.state.subscribe(), self.notices.clone())
    }

    pub fn state(&self) -> CloudConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CloudConnectionState> {
        self.state.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<BridgeNotice> {
        self.notices.subscribe()
    }

    pub fn cloud(&self) -> &CloudConnector<L, S> {
        &self.cloud
    }

    pub fn cloud_mut(&mut self) -> &mut CloudConnector<L, S> {
        &mut self.cloud
    }

    pub fn gateway(&self) -> &GatewayConnector<G> {
        &self.gateway
    }

    /// First evaluation once the network state is known.
    pub fn start(&mut self, network: NetworkState) {
        self.network = network;
        info!(target: LOG, enabled = self.enabled, ?network, "remote access starting");
        self.evaluate(false);
        self.pump();
    }

    pub fn on_network(&mut self, network: NetworkState) {
        if self.network == network {
            return;
        }
        info!(target: LOG, ?network, "network reachability changed");
        self.network = network;
        if network == NetworkState::Online && self.enabled {
            self.evaluate(true);
        }
        self.pump();
    }

    pub fn on_link_event(&mut self, event: LinkEvent) {
        self.cloud.handle_link_event(event);
        self.pump();
    }

    pub fn on_gateway_input(&mut self, input: GatewayInput) {
        self.gateway.handle_input(input);
        self.pump();
    }

    pub fn heartbeat(&mut self) {
        self.gateway.heartbeat();
    }

    /// Housekeeping: request and pairing timeouts, cache expiry.
    pub fn expire(&mut self) {
        self.cloud.expire();
        self.gateway.expire();
        self.pump();
    }

    /// Returns false once the bridge should stop.
    pub fn handle_command(&mut self, command: BridgeCommand) -> bool {
        match command {
            BridgeCommand::Pair {
                id_token,
                user_id,
                reply,
            } => {
                let transaction = self.cloud.pair(&id_token, &user_id);
                self.pairings.insert(transaction, reply);
            }
            BridgeCommand::SetDeviceName(name) => {
                self.config.device_name = name;
                self.cloud.set_device_name(&self.config.device_name);
            }
            BridgeCommand::SetEnabled(enabled) => self.set_enabled(enabled),
            BridgeCommand::SendPushNotification {
                endpoint_id,
                title,
                body,
            } => {
                if self
                    .cloud
                    .send_push_notification(&endpoint_id, &title, &body)
                    .is_none()
                {
                    warn!(target: LOG, %endpoint_id, "push notification not sent");
                }
            }
            BridgeCommand::RequestTurnCredentials => self.cloud.request_turn_credentials(),
            BridgeCommand::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        self.pump();
        true
    }

    pub fn shutdown(&mut self) {
        info!(target: LOG, "remote access shutting down");
        self.stop_cloud();
        self.pairings.clear();
        self.publish_state();
    }

    fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        info!(target: LOG, enabled, "remote access toggled");
        self.enabled = enabled;
        if enabled {
            self.evaluate(false);
        } else {
            self.stop_cloud();
        }
    }

    fn stop_cloud(&mut self) {
        if self.cloud.state() != ConnectionState::Disconnected {
            self.cloud.disconnect();
            self.stopping = self.cloud.state() != ConnectionState::Disconnected;
        }
    }

    /// Decide whether the cloud should be connected. `restart` retries a
    /// session that is connecting but not yet ready.
    fn evaluate(&mut self, restart: bool) {
        if !self.enabled {
            self.stop_cloud();
            return;
        }
        let target = match self.config.broker_target() {
            Ok(target) => target,
            Err(ConfigError::Incomplete(missing)) => {
                for item in &missing {
                    warn!(target: LOG, missing = %item, "remote access not configured");
                }
                self.configured = false;
                self.stop_cloud();
                return;
            }
            Err(ConfigError::Cloud(err)) => {
                warn!(target: LOG, error = %err, "remote access configuration unusable");
                self.configured = false;
                self.stop_cloud();
                return;
            }
        };
        self.configured = true;
        if self.network != NetworkState::Online {
            debug!(target: LOG, "waiting for network before connecting");
            return;
        }
        if self.stopping {
            debug!(target: LOG, "waiting for the previous cloud session to close");
            return;
        }
        let idle = self.cloud.state() == ConnectionState::Disconnected;
        if idle || (restart && !self.cloud.is_ready()) {
            self.cloud.connect(target);
        }
    }

    /// Drain both connectors' event queues until neither has anything left.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            while let Some(event) = self.cloud.poll_event() {
                progressed = true;
                self.route_cloud(event);
            }
            while let Some(event) = self.gateway.poll_event() {
                progressed = true;
                self.route_gateway(event);
            }
            if self.stopping && self.cloud.state() == ConnectionState::Disconnected {
                self.stopping = false;
                if self.enabled {
                    progressed = true;
                    self.evaluate(false);
                }
            }
            if !progressed {
                break;
            }
        }
        self.publish_state();
    }

    fn route_cloud(&mut self, event: CloudEvent) {
        match event {
            CloudEvent::Connected => info!(target: LOG, "cloud connected"),
            CloudEvent::Disconnected => info!(target: LOG, "cloud disconnected"),
            CloudEvent::HandshakeReceived {
                session_id,
                payload,
            } => {
                debug!(target: LOG, %session_id, "handshake to gateway");
                self.gateway.send_handshake(&session_id, &payload);
            }
            CloudEvent::PairingFinished {
                transaction,
                user_id,
                outcome,
            } => {
                if let Some(reply) = self.pairings.remove(&transaction) {
                    let _ = reply.send(outcome.clone());
                }
                self.notify(BridgeNotice::PairingFinished { user_id, outcome });
            }
            CloudEvent::PushEndpointsUpdated(endpoints) => {
                self.notify(BridgeNotice::PushEndpointsUpdated(endpoints));
            }
            CloudEvent::PushEndpointAdded(endpoint) => {
                self.notify(BridgeNotice::PushEndpointAdded(endpoint));
            }
            CloudEvent::PushNotificationSent {
                transaction,
                status,
            } => self.notify(BridgeNotice::PushNotificationSent {
                transaction,
                status,
            }),
            CloudEvent::TurnCredentials(credentials) => {
                self.notify(BridgeNotice::TurnCredentials(credentials));
            }
            CloudEvent::ProxyConnectionRequested { token, nonce } => {
                self.notify(BridgeNotice::ProxyConnectionRequested { token, nonce });
            }
        }
    }

    fn route_gateway(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Handshake {
                session_id,
                message,
            } => {
                debug!(target: LOG, %session_id, kind = message.kind(), "handshake to cloud");
                if self
                    .cloud
                    .send_handshake(&session_id, &message.to_value())
                    .is_none()
                {
                    warn!(target: LOG, %session_id, "cloud not ready; reply dropped");
                }
            }
            GatewayEvent::SessionClosed { session_id, reason } => {
                info!(target: LOG, %session_id, ?reason, "gateway session closed");
            }
        }
    }

    fn notify(&self, notice: BridgeNotice) {
        // nobody listening is fine
        let _ = self.notices.send(notice);
    }

    fn publish_state(&self) {
        let next = if !self.enabled {
            CloudConnectionState::Disabled
        } else if !self.configured {
            CloudConnectionState::Unconfigured
        } else if self.cloud.is_ready() {
            CloudConnectionState::Connected
        } else {
            CloudConnectionState::Connecting
        };
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(target: LOG, from = ?*current, to = ?next, "cloud connection state");
            *current = next;
            true
        });
    }
}
