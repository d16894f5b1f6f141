use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cloud_link::{BusLink, MemoryIdentityStore, PairingOutcome, StoredIdentity};
use gateway_signaling::mock::ScriptedGatewayLink;
use gateway_signaling::GatewayInput;
use hub_remote::{
    BridgeHandle, CloudConnectionState, EventLoop, NetworkState, RemoteAccessBridge,
    RemoteAccessConfig,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use transport_bus::{Bus, LocalBus};

fn json_bytes(value: Value) -> Bytes {
    Bytes::from(value.to_string())
}

struct Hub {
    bus: Arc<LocalBus>,
    gateway: ScriptedGatewayLink,
    gateway_tx: mpsc::UnboundedSender<GatewayInput>,
    network: watch::Sender<NetworkState>,
    handle: BridgeHandle,
    task: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

fn complete_config(dir: &Path) -> RemoteAccessConfig {
    for name in ["ca.pem", "cert.pem", "key.pem"] {
        fs::write(dir.join(name), b"pem").expect("write pem");
    }
    RemoteAccessConfig {
        cloud_endpoint: Some("local".into()),
        device_id: Some("dev-1".into()),
        ca_cert: Some(dir.join("ca.pem")),
        client_cert: Some(dir.join("cert.pem")),
        client_key: Some(dir.join("key.pem")),
        ..RemoteAccessConfig::new(dir)
    }
}

fn start_hub(bus: Arc<LocalBus>) -> Hub {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = complete_config(dir.path());
    let (cloud_tx, cloud_rx) = mpsc::unbounded_channel();
    let (gateway_tx, gateway_rx) = mpsc::unbounded_channel();
    let gateway = ScriptedGatewayLink::new();
    let store = MemoryIdentityStore::with_identity(StoredIdentity {
        registered: true,
        synced_name: Some("Hub".into()),
    });
    let bridge = RemoteAccessBridge::new(
        config,
        BusLink::new(bus.clone(), cloud_tx),
        store,
        gateway.clone(),
    );
    let (network, network_rx) = watch::channel(NetworkState::Offline);
    let (event_loop, handle) = EventLoop::new(
        bridge,
        cloud_rx,
        gateway_rx,
        network_rx,
        Duration::from_secs(5),
    );
    let task = tokio::spawn(event_loop.run());
    Hub {
        bus,
        gateway,
        gateway_tx,
        network,
        handle,
        task,
        _dir: dir,
    }
}

impl Hub {
    async fn wait_state(&self, wanted: CloudConnectionState) {
        let mut state = self.handle.watch_state();
        state
            .wait_for(|current| *current == wanted)
            .await
            .expect("bridge alive");
    }

    /// Wait until the gateway link has seen a request of `kind` and return it.
    async fn gateway_request(&self, kind: &str) -> Value {
        loop {
            if let Some(request) = self
                .gateway
                .requests()
                .into_iter()
                .rev()
                .find(|frame| frame["janus"] == kind)
            {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn gateway_reply(&self, request: &Value, mut frame: Value) {
        frame["transaction"] = request["transaction"].clone();
        self.gateway_tx
            .send(GatewayInput::Frame(frame.to_string()))
            .expect("event loop alive");
    }

    fn answer_users(&self, users: Value) {
        self.bus
            .publish(
                "dev-1/device/users/response",
                json_bytes(json!({ "users": users })),
            )
            .expect("publish");
    }
}

#[test_timeout::tokio_timeout_test(15)]
async fn handshake_round_trip_through_bridge() {
    let bus = Arc::new(LocalBus::new());
    let mut users_requests = bus.subscribe("dev-1/device/users").expect("subscribe");
    let mut replies = bus.subscribe("dev-1/+/+/reply").expect("subscribe");
    let hub = start_hub(Arc::clone(&bus));

    hub.wait_state(CloudConnectionState::Connecting).await;
    hub.network.send(NetworkState::Online).expect("network");
    users_requests.recv().await.expect("users request");
    hub.answer_users(json!(["user-1"]));
    hub.wait_state(CloudConnectionState::Connected).await;

    let jsep = json!({"type": "offer", "sdp": "v=0\r\no=- 1 1 IN IP4 0.0.0.0"});
    bus.publish(
        "dev-1/user-1/42",
        json_bytes(json!({"id": 1, "type": "offer", "jsep": jsep})),
    )
    .expect("publish");

    let create = hub.gateway_request("create").await;
    hub.gateway_reply(&create, json!({"janus": "success", "data": {"id": 10}}));
    let attach = hub.gateway_request("attach").await;
    assert_eq!(attach["session_id"], 10);
    hub.gateway_reply(
        &attach,
        json!({"janus": "success", "session_id": 10, "data": {"id": 20}}),
    );
    let message = hub.gateway_request("message").await;
    assert_eq!(message["jsep"], jsep);
    assert_eq!(message["handle_id"], 20);

    hub.gateway_reply(&message, json!({"janus": "ack", "session_id": 10}));
    hub.gateway_reply(
        &message,
        json!({
            "janus": "event",
            "session_id": 10,
            "jsep": {"type": "answer", "sdp": "v=0 answer"}
        }),
    );

    let ack = replies.recv().await.expect("ack reply");
    assert_eq!(ack.topic, "dev-1/user-1/42/reply");
    let ack: Value = serde_json::from_slice(&ack.payload).expect("json");
    assert_eq!(ack, json!({"type": "ack", "id": "1"}));

    let answer = replies.recv().await.expect("answer reply");
    let answer: Value = serde_json::from_slice(&answer.payload).expect("json");
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["id"], "1");
    assert_eq!(answer["jsep"]["sdp"], "v=0 answer");

    assert!(hub.handle.shutdown());
    hub.task.await.expect("event loop");
}

#[test_timeout::tokio_timeout_test(15)]
async fn reenabling_reconnects_once_network_is_up() {
    let bus = Arc::new(LocalBus::new());
    let mut users_requests = bus.subscribe("dev-1/device/users").expect("subscribe");
    let hub = start_hub(Arc::clone(&bus));

    hub.network.send(NetworkState::Online).expect("network");
    users_requests.recv().await.expect("users request");
    hub.answer_users(json!([]));
    hub.wait_state(CloudConnectionState::Connected).await;

    assert!(hub.handle.set_enabled(false));
    hub.wait_state(CloudConnectionState::Disabled).await;
    hub.network.send(NetworkState::Offline).expect("network");
    hub.network.send(NetworkState::Online).expect("network");
    assert_eq!(hub.handle.state(), CloudConnectionState::Disabled);

    assert!(hub.handle.set_enabled(true));
    users_requests.recv().await.expect("second users request");
    hub.answer_users(json!([]));
    hub.wait_state(CloudConnectionState::Connected).await;

    let mut pair_requests = bus.subscribe("dev-1/pair").expect("subscribe");
    let cloud = async {
        let request = pair_requests.recv().await.expect("pair request");
        let request: Value = serde_json::from_slice(&request.payload).expect("json");
        assert_eq!(request["userId"], "user-2");
        bus.publish(
            "dev-1/pair/response",
            json_bytes(json!({"id": request["id"], "status": 200, "result": {"message": "ok"}})),
        )
        .expect("publish");
    };
    let (outcome, ()) = tokio::join!(hub.handle.pair("token", "user-2"), cloud);
    assert_eq!(outcome, PairingOutcome::Paired);

    drop(hub.handle);
    hub.task.await.expect("event loop");
}
