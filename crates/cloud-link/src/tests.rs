use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};

use crate::mock::{LinkCall, RecordingLink};
use crate::*;

const DEVICE: &str = "dev-1";
const NAME: &str = "Living Room";

struct Harness {
    connector: CloudConnector<RecordingLink, MemoryIdentityStore>,
    link: RecordingLink,
    store: MemoryIdentityStore,
}

impl Harness {
    fn new(registered: bool) -> Self {
        let link = RecordingLink::new();
        let store = MemoryIdentityStore::with_identity(StoredIdentity {
            registered,
            synced_name: None,
        });
        let connector = CloudConnector::new(
            link.clone(),
            store.clone(),
            DEVICE,
            NAME,
            CloudSettings::default(),
        );
        Self {
            connector,
            link,
            store,
        }
    }

    fn connect(&mut self) {
        let target = BrokerTarget::new("broker.test:8883", DEVICE).expect("valid target");
        self.connector.connect(target);
        self.connector.handle_link_event(LinkEvent::Connected);
    }

    fn deliver(&mut self, topic: &str, payload: Value) {
        self.connector.handle_link_event(LinkEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::from(payload.to_string()),
        });
    }

    fn ack_subscription(&mut self, filter: &str) {
        let request = self
            .link
            .subscribed()
            .into_iter()
            .rev()
            .find(|(_, filters)| filters.iter().any(|existing| existing == filter))
            .map(|(request, _)| request)
            .expect("subscription was issued");
        self.connector.handle_link_event(LinkEvent::Completed {
            request,
            completion: Completion::Subscribed { granted: true },
        });
    }

    fn registration_topic(&self) -> String {
        self.link
            .subscribed()
            .into_iter()
            .flat_map(|(_, filters)| filters)
            .rev()
            .find(|filter| filter.starts_with("create/device/"))
            .expect("registration topic subscribed")
    }

    fn drop_link(&mut self) {
        self.connector.handle_link_event(LinkEvent::Disconnected {
            reason: Some("connection reset".into()),
        });
    }

    fn deliver_users(&mut self) {
        self.deliver(
            "dev-1/device/users/response",
            json!({"users": ["user-1"], "pushNotificationsEndpoints": []}),
        );
    }

    /// Registered device, connected, users received.
    fn make_ready(&mut self) {
        self.connect();
        self.deliver_users();
        assert_eq!(self.connector.state(), ConnectionState::Ready);
    }

    fn events(&mut self) -> Vec<CloudEvent> {
        std::iter::from_fn(|| self.connector.poll_event()).collect()
    }
}

#[test_timeout::timeout]
fn first_registration_reconnects_before_subscription_setup() {
    let mut h = Harness::new(false);
    h.connect();
    assert_eq!(h.connector.state(), ConnectionState::ConnectedUnregistered);
    assert!(h.link.published_to("create/device").is_empty());

    let registration = h.registration_topic();
    let ephemeral = registration
        .strip_prefix("create/device/")
        .expect("prefixed")
        .to_string();
    assert_ne!(ephemeral, DEVICE);
    h.ack_subscription(&registration);
    assert_eq!(h.connector.state(), ConnectionState::Registering);
    assert_eq!(
        h.link.published_to("create/device"),
        vec![json!({"id": ephemeral, "UUID": DEVICE})]
    );

    h.deliver(
        &registration,
        json!({"result": {"code": 201, "message": "Created"}}),
    );
    assert!(h.store.snapshot().registered);
    assert_eq!(
        h.connector.state(),
        ConnectionState::PendingPostRegistrationReconnect
    );
    assert_eq!(h.link.calls().last(), Some(&LinkCall::Disconnect));
    assert!(h.link.published_to("dev-1/device/users").is_empty());

    h.link.take_calls();
    h.connector
        .handle_link_event(LinkEvent::Disconnected { reason: None });
    assert_eq!(h.link.connects(), 1);
    assert!(h.store.snapshot().registered);
    assert!(h.events().is_empty());

    h.connector.handle_link_event(LinkEvent::Connected);
    assert_eq!(
        h.connector.state(),
        ConnectionState::SettingUpSubscriptions
    );
    assert_eq!(h.link.published_to("dev-1/device/users").len(), 1);
    assert!(h.link.published_to("create/device").is_empty());
}

#[test_timeout::timeout]
fn registered_device_starts_subscription_setup_immediately() {
    let mut h = Harness::new(true);
    h.connect();
    assert_eq!(
        h.connector.state(),
        ConnectionState::SettingUpSubscriptions
    );
    let filters: Vec<String> = h
        .link
        .subscribed()
        .into_iter()
        .flat_map(|(_, filters)| filters)
        .collect();
    assert!(filters.contains(&"dev-1/pair/response".to_string()));
    assert!(filters.contains(&"dev-1/device/users/response".to_string()));
    assert!(!filters.iter().any(|filter| filter.starts_with("create/device")));
    assert!(h.link.published_to("create/device").is_empty());

    let users = h.link.published_to("dev-1/device/users");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["command"], "getUsers");
}

#[test_timeout::timeout]
fn already_registered_response_continues_on_same_connection() {
    let mut h = Harness::new(false);
    h.connect();
    let registration = h.registration_topic();
    h.ack_subscription(&registration);
    h.deliver(&registration, json!({"result": {"code": 200}}));

    assert!(h.store.snapshot().registered);
    assert!(!h.link.calls().contains(&LinkCall::Disconnect));
    assert_eq!(
        h.connector.state(),
        ConnectionState::SettingUpSubscriptions
    );
    assert_eq!(h.link.published_to("dev-1/device/users").len(), 1);
}

#[test_timeout::timeout]
fn rejected_registration_stays_unregistered() {
    let mut h = Harness::new(false);
    h.connect();
    let registration = h.registration_topic();
    h.ack_subscription(&registration);
    h.deliver(
        &registration,
        json!({"result": {"code": 403, "message": "Forbidden"}}),
    );

    assert!(!h.store.snapshot().registered);
    assert_eq!(
        h.connector.state(),
        ConnectionState::ConnectedUnregistered
    );
    assert!(h.link.published_to("dev-1/device/users").is_empty());
    assert!(!h
        .link
        .subscribed()
        .iter()
        .any(|(_, filters)| filters.contains(&"dev-1/pair/response".to_string())));
}

#[test_timeout::timeout]
fn stale_registration_response_is_ignored() {
    let mut h = Harness::new(false);
    h.connect();
    let registration = h.registration_topic();
    h.ack_subscription(&registration);
    h.deliver("create/device/someone-else", json!({"result": {"code": 201}}));
    assert!(!h.store.snapshot().registered);
    assert_eq!(h.connector.state(), ConnectionState::Registering);
}

#[test_timeout::timeout]
fn successful_pairing_refreshes_users() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();

    let transaction = h.connector.pair("tokA", "user1");
    let requests = h.link.published_to("dev-1/pair");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["idToken"], "tokA");
    assert_eq!(requests[0]["userId"], "user1");
    assert_eq!(requests[0]["id"], transaction);

    h.link.take_calls();
    h.deliver(
        "dev-1/pair/response",
        json!({"id": transaction, "status": 200}),
    );
    assert_eq!(
        h.events(),
        vec![CloudEvent::PairingFinished {
            transaction,
            user_id: "user1".into(),
            outcome: PairingOutcome::Paired,
        }]
    );
    let refresh = h.link.published_to("dev-1/device/users");
    assert_eq!(refresh.len(), 1);
    assert_eq!(refresh[0]["command"], "getUsers");
    assert_eq!(h.connector.pending_pairings(), 0);
}

#[test_timeout::timeout]
fn rejected_pairing_reports_status_and_message() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();
    let transaction = h.connector.pair("bad", "user2");
    h.deliver(
        "dev-1/pair/response",
        json!({"id": transaction, "status": 401, "result": {"message": "invalid token"}}),
    );
    assert_eq!(
        h.events(),
        vec![CloudEvent::PairingFinished {
            transaction,
            user_id: "user2".into(),
            outcome: PairingOutcome::Rejected {
                status: 401,
                message: "invalid token".into(),
            },
        }]
    );
}

#[test_timeout::timeout]
fn pairing_while_offline_fails_without_publishing() {
    let mut h = Harness::new(true);
    let transaction = h.connector.pair("tok", "user1");
    assert_eq!(
        h.events(),
        vec![CloudEvent::PairingFinished {
            transaction,
            user_id: "user1".into(),
            outcome: PairingOutcome::NotConnected,
        }]
    );
    assert!(h.link.published().is_empty());
    assert_eq!(h.connector.pending_pairings(), 0);
}

#[test_timeout::tokio_timeout_test(5, paused)]
async fn unknown_and_timed_out_pairings() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();

    h.deliver("dev-1/pair/response", json!({"id": 999, "status": 200}));
    assert!(h.events().is_empty());

    let transaction = h.connector.pair("tok", "user1");
    tokio::time::advance(Duration::from_secs(29)).await;
    h.connector.expire();
    assert!(h.events().is_empty());

    tokio::time::advance(Duration::from_secs(2)).await;
    h.connector.expire();
    assert_eq!(
        h.events(),
        vec![CloudEvent::PairingFinished {
            transaction,
            user_id: "user1".into(),
            outcome: PairingOutcome::TimedOut,
        }]
    );
    h.connector.expire();
    h.deliver(
        "dev-1/pair/response",
        json!({"id": transaction, "status": 200}),
    );
    assert!(h.events().is_empty());
}

#[test_timeout::timeout]
fn duplicate_handshake_is_delivered_once() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();

    let offer = json!({"id": 5, "type": "offer", "jsep": {"type": "offer", "sdp": "v=0"}});
    h.deliver("dev-1/user-1/1700000000", offer.clone());
    h.deliver("dev-1/user-1/1700000000", offer.clone());
    assert_eq!(
        h.events(),
        vec![CloudEvent::HandshakeReceived {
            session_id: "dev-1/user-1/1700000000".into(),
            payload: offer,
        }]
    );

    h.deliver(
        "dev-1/user-1/1700000000",
        json!({"id": 5, "type": "trickle", "candidate": {"candidate": "a"}}),
    );
    assert_eq!(h.events().len(), 1);
}

#[test_timeout::timeout]
fn own_replies_are_dropped_without_dedup_entry() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();

    let answer = json!({"id": 8, "type": "answer", "jsep": {"type": "answer"}});
    h.deliver("dev-1/user-1/1700000000/reply", answer.clone());
    assert!(h.events().is_empty());

    h.deliver("dev-1/user-1/1700000000", answer);
    assert_eq!(h.events().len(), 1);
}

#[test_timeout::timeout]
fn signaling_from_unknown_users_is_ignored() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();
    h.deliver(
        "dev-1/stranger/1700000000",
        json!({"id": 1, "type": "offer"}),
    );
    h.deliver("dev-1/user-1/1700000000", json!({"type": "offer"}));
    assert!(h.events().is_empty());
}

#[test_timeout::timeout]
fn proxy_requests_are_deduplicated() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();
    let request = json!({"token": "tok", "timestamp": "1700000000"});
    h.deliver("dev-1/user-1/proxy", request.clone());
    h.deliver("dev-1/user-1/proxy", request);
    h.deliver(
        "dev-1/user-1/proxy",
        json!({"token": "tok", "timestamp": 1700000001}),
    );
    assert_eq!(
        h.events(),
        vec![
            CloudEvent::ProxyConnectionRequested {
                token: "tok".into(),
                nonce: "1700000000".into(),
            },
            CloudEvent::ProxyConnectionRequested {
                token: "tok".into(),
                nonce: "1700000001".into(),
            },
        ]
    );
}

#[test_timeout::tokio_timeout_test(5, paused)]
async fn six_rapid_drops_clear_registration_before_reconnecting() {
    let mut h = Harness::new(true);
    h.make_ready();

    for drop in 1..=6 {
        tokio::time::advance(Duration::from_secs(8)).await;
        h.drop_link();
        let registered = h.store.snapshot().registered;
        assert_eq!(h.link.connects(), 1 + drop, "reconnect after drop {drop}");
        if drop < 6 {
            assert!(registered, "drop {drop} must not reset registration");
            h.connector.handle_link_event(LinkEvent::Connected);
            h.deliver_users();
            assert!(h.connector.is_ready());
        } else {
            assert!(!registered);
        }
    }

    h.connector.handle_link_event(LinkEvent::Connected);
    assert_eq!(
        h.connector.state(),
        ConnectionState::ConnectedUnregistered
    );
}

#[test_timeout::tokio_timeout_test(5, paused)]
async fn slow_drops_never_force_registration() {
    let mut h = Harness::new(true);
    h.make_ready();
    for _ in 0..8 {
        tokio::time::advance(Duration::from_secs(61)).await;
        h.drop_link();
        h.connector.handle_link_event(LinkEvent::Connected);
        h.deliver_users();
    }
    assert!(h.store.snapshot().registered);
    assert!(h.connector.is_ready());
}

#[test_timeout::tokio_timeout_test(5, paused)]
async fn caller_disconnects_are_not_counted_as_drops() {
    let mut h = Harness::new(true);
    h.make_ready();
    for _ in 0..8 {
        tokio::time::advance(Duration::from_secs(2)).await;
        h.connector.disconnect();
        h.connector
            .handle_link_event(LinkEvent::Disconnected { reason: None });
        h.connect();
        h.deliver_users();
    }
    assert!(h.store.snapshot().registered);
    assert!(h.connector.is_ready());
}

#[test_timeout::timeout]
fn drop_during_setup_forces_registration() {
    let mut h = Harness::new(true);
    h.store.clone().set_synced_name(Some(NAME));
    h.connect();
    assert_eq!(
        h.connector.state(),
        ConnectionState::SettingUpSubscriptions
    );
    h.drop_link();
    let stored = h.store.snapshot();
    assert!(!stored.registered);
    assert_eq!(stored.synced_name, None);
    assert_eq!(h.connector.state(), ConnectionState::Connecting);
}

#[test_timeout::tokio_timeout_test(5, paused)]
async fn forced_registration_aborts_pending_pairings() {
    let mut h = Harness::new(true);
    h.make_ready();
    let transaction = h.connector.pair("tok", "user1");
    h.events();

    for _ in 0..5 {
        h.drop_link();
        h.connector.handle_link_event(LinkEvent::Connected);
        h.deliver_users();
    }
    h.events();
    h.drop_link();

    assert!(h.events().contains(&CloudEvent::PairingFinished {
        transaction,
        user_id: "user1".into(),
        outcome: PairingOutcome::Aborted,
    }));
    assert_eq!(h.connector.pending_pairings(), 0);
}

#[test_timeout::timeout]
fn disconnect_clears_packet_table() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.connector.pair("tok", "user1");
    assert!(h.connector.tracked_packets() > 0);
    h.drop_link();
    assert_eq!(h.connector.tracked_packets(), 0);
}

#[test_timeout::timeout]
fn acknowledgements_are_consumed_once() {
    let mut h = Harness::new(true);
    h.make_ready();
    let before = h.connector.tracked_packets();
    let request = h
        .connector
        .send_handshake("dev-1/user-1/1", &json!({"id": 1, "type": "ack"}))
        .expect("published");
    assert_eq!(h.connector.tracked_packets(), before + 1);
    let ack = LinkEvent::Completed {
        request,
        completion: Completion::Published,
    };
    h.connector.handle_link_event(ack.clone());
    h.connector.handle_link_event(ack);
    assert_eq!(h.connector.tracked_packets(), before);
}

#[test_timeout::timeout]
fn caller_disconnect_does_not_reconnect() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();
    h.connector.disconnect();
    assert_eq!(h.link.calls().last(), Some(&LinkCall::Disconnect));
    h.connector
        .handle_link_event(LinkEvent::Disconnected { reason: None });
    assert_eq!(h.connector.state(), ConnectionState::Disconnected);
    assert_eq!(h.link.connects(), 1);
    assert_eq!(h.events(), vec![CloudEvent::Disconnected]);
}

#[test_timeout::timeout]
fn handshake_replies_go_to_reply_topic() {
    let mut h = Harness::new(true);
    h.make_ready();
    let answer = json!({"id": 3, "type": "answer", "jsep": {"type": "answer", "sdp": "v=0"}});
    h.connector
        .send_handshake("dev-1/user-1/1700000000", &answer)
        .expect("published");
    assert_eq!(
        h.link.published_to("dev-1/user-1/1700000000/reply"),
        vec![answer]
    );
}

#[test_timeout::timeout]
fn device_name_is_synced_once() {
    let mut h = Harness::new(true);
    h.make_ready();
    let posted = h.link.published_to("dev-1/device/name");
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0]["name"], NAME);
    assert_eq!(posted[0]["command"], "postName");

    h.deliver("dev-1/device/name/response", json!({"status": 200}));
    assert_eq!(h.store.snapshot().synced_name.as_deref(), Some(NAME));

    h.link.take_calls();
    h.deliver_users();
    assert!(h.link.published_to("dev-1/device/name").is_empty());

    h.connector.set_device_name("Kitchen");
    let posted = h.link.published_to("dev-1/device/name");
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0]["name"], "Kitchen");
}

#[test_timeout::timeout]
fn users_response_subscribes_user_trees() {
    let mut h = Harness::new(true);
    h.connect();
    h.link.take_calls();
    h.deliver(
        "dev-1/device/users/response",
        json!({
            "users": ["a", "b"],
            "pushNotificationsEndpoints": [
                {"a": [{"endpointId": "ep-1", "displayName": "Phone"}]}
            ]
        }),
    );
    let filters: Vec<String> = h
        .link
        .subscribed()
        .into_iter()
        .flat_map(|(_, filters)| filters)
        .collect();
    assert_eq!(filters, vec!["dev-1/a/#".to_string(), "dev-1/b/#".to_string()]);
    let events = h.events();
    assert_eq!(
        events[0],
        CloudEvent::PushEndpointsUpdated(vec![PushEndpoint {
            user_id: "a".into(),
            endpoint_id: "ep-1".into(),
            display_name: "Phone".into(),
        }])
    );
    assert_eq!(events[1], CloudEvent::Connected);
}

#[test_timeout::timeout]
fn push_notifications_round_trip_through_cloud() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();
    let transaction = h
        .connector
        .send_push_notification("ep-1", "Door", "Front door opened")
        .expect("sent");
    let sent = h.link.published_to("dev-1/notify/user/ep-1");
    assert_eq!(sent[0]["title"], "Door");
    assert_eq!(sent[0]["id"], transaction);

    h.deliver(
        "dev-1/notify/response",
        json!({"id": transaction, "status": 200}),
    );
    h.deliver(
        "dev-1/notify/info/endpoint",
        json!({"newPushNotificationsEndpoint": {"user-1": {"endpointId": "ep-2", "displayName": "Tablet"}}}),
    );
    assert_eq!(
        h.events(),
        vec![
            CloudEvent::PushNotificationSent {
                transaction,
                status: 200
            },
            CloudEvent::PushEndpointAdded(PushEndpoint {
                user_id: "user-1".into(),
                endpoint_id: "ep-2".into(),
                display_name: "Tablet".into(),
            }),
        ]
    );
}

#[test_timeout::tokio_timeout_test(5, paused)]
async fn turn_credentials_are_cached_and_refreshed() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();
    assert_eq!(h.link.published_to("dev-1/services/turn").len(), 1);

    let credentials = json!({"username": "u", "password": "p", "ttl": 60, "uris": []});
    h.deliver(
        "dev-1/services/turn/response",
        json!({"result": {"code": 201}, "turnCredentials": credentials}),
    );
    assert_eq!(
        h.events(),
        vec![CloudEvent::TurnCredentials(Some(credentials.clone()))]
    );

    h.link.take_calls();
    h.connector.request_turn_credentials();
    assert_eq!(
        h.events(),
        vec![CloudEvent::TurnCredentials(Some(credentials))]
    );
    assert!(h.link.published_to("dev-1/services/turn").is_empty());

    tokio::time::advance(Duration::from_secs(50)).await;
    h.connector.expire();
    assert_eq!(h.link.published_to("dev-1/services/turn").len(), 1);
}

#[test_timeout::timeout]
fn failed_turn_response_reports_none() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();
    h.deliver(
        "dev-1/services/turn/response",
        json!({"result": {"code": 500, "message": "boom"}}),
    );
    assert_eq!(h.events(), vec![CloudEvent::TurnCredentials(None)]);
}

#[test_timeout::timeout]
fn malformed_payloads_are_dropped() {
    let mut h = Harness::new(true);
    h.make_ready();
    h.events();
    h.connector.handle_link_event(LinkEvent::Message {
        topic: "dev-1/user-1/1".into(),
        payload: Bytes::from_static(b"{not json"),
    });
    h.deliver("dev-1/pair/response", json!({"status": 200}));
    assert!(h.events().is_empty());
    assert!(h.connector.is_ready());
}
