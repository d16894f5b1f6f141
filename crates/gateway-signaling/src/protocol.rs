//! Gateway wire frames. Requests and replies are single JSON objects, one per
//! line, discriminated by the `janus` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PLUGIN: &str = "janus.plugin.hubremote";
pub const HEARTBEAT_TRANSACTION: &str = "hub-remote-heartbeat";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupBody {
    pub request: &'static str,
}

impl SetupBody {
    pub fn setup() -> Self {
        Self { request: "setup" }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum GatewayRequest {
    Create {
        transaction: String,
    },
    Attach {
        transaction: String,
        session_id: u64,
        plugin: String,
        opaque_id: String,
    },
    Message {
        transaction: String,
        session_id: u64,
        handle_id: u64,
        body: SetupBody,
        jsep: Value,
    },
    Trickle {
        transaction: String,
        session_id: u64,
        handle_id: u64,
        candidate: Value,
    },
    Ping {
        transaction: String,
    },
}

impl GatewayRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayRequest::Create { .. } => "create",
            GatewayRequest::Attach { .. } => "attach",
            GatewayRequest::Message { .. } => "message",
            GatewayRequest::Trickle { .. } => "trickle",
            GatewayRequest::Ping { .. } => "ping",
        }
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplyData {
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplyError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayReply {
    pub janus: String,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub session_id: Option<Value>,
    #[serde(default)]
    pub data: Option<ReplyData>,
    #[serde(default)]
    pub jsep: Option<Value>,
    #[serde(default)]
    pub error: Option<ReplyError>,
}

impl GatewayReply {
    pub fn data_id(&self) -> Option<&Value> {
        self.data.as_ref().and_then(|data| data.id.as_ref())
    }

    /// The jsep payload when it carries an SDP answer.
    pub fn answer(&self) -> Option<&Value> {
        self.jsep
            .as_ref()
            .filter(|jsep| jsep.get("type").and_then(Value::as_str) == Some("answer"))
    }

    pub fn error_reason(&self) -> &str {
        self.error
            .as_ref()
            .map(|error| error.reason.as_str())
            .unwrap_or("")
    }
}
