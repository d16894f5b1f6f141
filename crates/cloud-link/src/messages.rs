//! JSON payloads exchanged with the cloud.

use std::collections::HashMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

pub const GET_USERS: &str = "getUsers";
pub const POST_NAME: &str = "postName";
pub const PUSH_NOTIFICATION: &str = "sendPushNotification";
pub const GET_TURN_CREDENTIALS: &str = "getTurnCredentials";

pub fn unix_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn unix_secs() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[derive(Debug, Serialize)]
pub struct CreateDevice<'a> {
    pub id: &'a str,
    #[serde(rename = "UUID")]
    pub uuid: &'a str,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultBody {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateDeviceResponse {
    #[serde(default)]
    pub result: ResultBody,
}

#[derive(Debug, Serialize)]
pub struct GetUsers {
    pub command: &'static str,
    pub id: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PushEndpointEntry {
    #[serde(rename = "endpointId")]
    pub endpoint_id: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
pub struct UsersResponse {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(rename = "pushNotificationsEndpoints", default)]
    pub push_endpoints: Vec<HashMap<String, Vec<PushEndpointEntry>>>,
}

#[derive(Debug, Serialize)]
pub struct PostName<'a> {
    pub command: &'static str,
    pub name: &'a str,
    pub id: u64,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub status: u16,
}

#[derive(Debug, Serialize)]
pub struct PairRequest<'a> {
    #[serde(rename = "idToken")]
    pub id_token: &'a str,
    #[serde(rename = "userId")]
    pub user_id: &'a str,
    pub id: u64,
    pub timestamp: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct PairResponse {
    pub id: u64,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub result: ResultMessage,
}

#[derive(Debug, Serialize)]
pub struct PushNotification<'a> {
    pub command: &'static str,
    pub id: u64,
    pub title: &'a str,
    pub body: &'a str,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct NotifyResponse {
    pub id: u64,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct NewEndpointNotice {
    #[serde(rename = "newPushNotificationsEndpoint", default)]
    pub endpoints: HashMap<String, PushEndpointEntry>,
}

#[derive(Debug, Serialize)]
pub struct TurnRequest<'a> {
    pub command: &'static str,
    pub id: &'a str,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct TurnResponse {
    #[serde(default)]
    pub result: ResultBody,
    #[serde(rename = "turnCredentials", default)]
    pub credentials: Option<Value>,
}

/// The two fields every signaling message carries, used for dedup.
#[derive(Debug, Deserialize)]
pub struct SignalHeader {
    pub id: WireId,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct ProxyRequest {
    pub token: String,
    /// Also serves as the nonce handed to the proxy layer.
    #[serde(default)]
    pub timestamp: WireId,
}

/// Ids arrive as JSON strings or numbers depending on the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct WireId(pub String);

impl fmt::Display for WireId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for WireId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct WireIdVisitor;

        impl<'de> Visitor<'de> for WireIdVisitor {
            type Value = WireId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a string or numeric id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<WireId, E> {
                Ok(WireId(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<WireId, E> {
                Ok(WireId(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<WireId, E> {
                Ok(WireId(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<WireId, E> {
                Ok(WireId(v.to_string()))
            }
        }

        deserializer.deserialize_any(WireIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn signal_header_accepts_numeric_and_string_ids() {
        let numeric: SignalHeader =
            serde_json::from_value(json!({"id": 7, "type": "offer"})).expect("numeric id");
        assert_eq!(numeric.id, WireId("7".into()));
        let text: SignalHeader =
            serde_json::from_value(json!({"id": "abc", "type": "trickle"})).expect("string id");
        assert_eq!(text.id.to_string(), "abc");
        assert!(serde_json::from_value::<SignalHeader>(json!({"type": "offer"})).is_err());
    }

    #[test_timeout::timeout]
    fn users_response_reads_push_endpoints() {
        let response: UsersResponse = serde_json::from_value(json!({
            "users": ["u1"],
            "pushNotificationsEndpoints": [
                {"u1": [{"endpointId": "e1", "displayName": "Phone"}]}
            ]
        }))
        .expect("parse users");
        assert_eq!(response.users, vec!["u1".to_string()]);
        assert_eq!(response.push_endpoints[0]["u1"][0].endpoint_id, "e1");
    }

    #[test_timeout::timeout]
    fn create_device_uses_uppercase_uuid_key() {
        let payload = serde_json::to_value(CreateDevice {
            id: "eph",
            uuid: "dev",
        })
        .expect("serialize");
        assert_eq!(payload, json!({"id": "eph", "UUID": "dev"}));
    }
}
