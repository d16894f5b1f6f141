//! Remote access for the hub.
//!
//! Wires the cloud connector and the gateway connector together behind a
//! [`RemoteAccessBridge`], driven by one [`EventLoop`] task.

pub mod bridge;
pub mod config;
pub mod event_loop;
pub mod network;
pub mod store;
pub mod telemetry;

use anyhow::{Context, Result};
use cloud_link::MqttLink;
use gateway_signaling::UnixSocketLink;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use bridge::{
    BridgeCommand, BridgeHandle, BridgeNotice, CloudConnectionState, RemoteAccessBridge,
};
pub use config::{Cli, RemoteAccessConfig};
pub use event_loop::EventLoop;
pub use network::{NetworkMonitor, NetworkState};
pub use store::FileIdentityStore;

/// Run remote access until ctrl-c.
pub async fn run(config: RemoteAccessConfig) -> Result<()> {
    let store = FileIdentityStore::open(&config.state_dir)
        .with_context(|| format!("failed to open state dir {}", config.state_dir.display()))?;
    info!(
        target: "hub_remote::bridge",
        status = %store.path().display(),
        registered = store.snapshot().registered,
        "loaded cloud status"
    );

    let (cloud_tx, cloud_rx) = mpsc::unbounded_channel();
    let (gateway_tx, gateway_rx) = mpsc::unbounded_channel();
    let cloud_link = MqttLink::new(cloud_tx);
    let gateway_link = UnixSocketLink::new(config.gateway_socket.clone(), gateway_tx);
    let monitor = NetworkMonitor::spawn(config.network_poll_interval);
    let heartbeat = config.heartbeat_interval;

    let bridge = RemoteAccessBridge::new(config, cloud_link, store, gateway_link);
    let (event_loop, handle) =
        EventLoop::new(bridge, cloud_rx, gateway_rx, monitor.subscribe(), heartbeat);

    let interrupt = handle.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!(target: "hub_remote::bridge", "interrupt received");
                interrupt.shutdown();
            }
            Err(err) => warn!(target: "hub_remote::bridge", error = %err, "cannot listen for ctrl-c"),
        }
    });

    event_loop.run().await;
    drop(handle);
    Ok(())
}
