use std::time::Duration;

use cloud_link::{BrokerLink, ConnectionState, IdentityStore, LinkEvent};
use gateway_signaling::{GatewayInput, GatewayLink};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::bridge::{BridgeCommand, BridgeHandle, RemoteAccessBridge};
use crate::network::NetworkState;

const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// The single task that owns the bridge. Transport workers only post into
/// its channels.
pub struct EventLoop<L, S, G> {
    bridge: RemoteAccessBridge<L, S, G>,
    cloud_events: mpsc::UnboundedReceiver<LinkEvent>,
    gateway_input: mpsc::UnboundedReceiver<GatewayInput>,
    network: watch::Receiver<NetworkState>,
    commands: mpsc::UnboundedReceiver<BridgeCommand>,
    heartbeat: Duration,
}

impl<L, S, G> EventLoop<L, S, G>
where
    L: BrokerLink,
    S: IdentityStore,
    G: GatewayLink,
{
    pub fn new(
        bridge: RemoteAccessBridge<L, S, G>,
        cloud_events: mpsc::UnboundedReceiver<LinkEvent>,
        gateway_input: mpsc::UnboundedReceiver<GatewayInput>,
        network: watch::Receiver<NetworkState>,
        heartbeat: Duration,
    ) -> (Self, BridgeHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let handle = bridge.handle(commands_tx);
        let event_loop = Self {
            bridge,
            cloud_events,
            gateway_input,
            network,
            commands,
            heartbeat,
        };
        (event_loop, handle)
    }

    pub async fn run(mut self) {
        let mut heartbeat = interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = interval(HOUSEKEEPING_PERIOD);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let initial = *self.network.borrow_and_update();
        self.bridge.start(initial);
        let mut network_open = true;

        loop {
            tokio::select! {
                Some(event) = self.cloud_events.recv() => self.bridge.on_link_event(event),
                Some(input) = self.gateway_input.recv() => self.bridge.on_gateway_input(input),
                changed = self.network.changed(), if network_open => match changed {
                    Ok(()) => {
                        let state = *self.network.borrow_and_update();
                        self.bridge.on_network(state);
                    }
                    Err(_) => {
                        debug!(target: "hub_remote::network", "network monitor stopped");
                        network_open = false;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.bridge.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        self.bridge.shutdown();
                        break;
                    }
                },
                _ = heartbeat.tick() => self.bridge.heartbeat(),
                _ = housekeeping.tick() => self.bridge.expire(),
            }
        }
        self.wait_for_disconnect().await;
    }

    /// Give the broker session a moment to close cleanly.
    async fn wait_for_disconnect(&mut self) {
        if self.bridge.cloud().state() == ConnectionState::Disconnected {
            return;
        }
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(event) = self.cloud_events.recv().await {
                let closed = matches!(event, LinkEvent::Disconnected { .. });
                self.bridge.on_link_event(event);
                if closed {
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!(target: "hub_remote::bridge", "broker did not confirm disconnect");
        }
    }

    pub fn bridge(&self) -> &RemoteAccessBridge<L, S, G> {
        &self.bridge
    }
}
