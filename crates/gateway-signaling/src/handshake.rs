use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Signaling messages exchanged with remote peers through the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HandshakeMessage {
    Offer {
        #[serde(deserialize_with = "flexible_id")]
        id: String,
        jsep: Value,
    },
    Trickle {
        #[serde(deserialize_with = "flexible_id")]
        id: String,
        #[serde(default)]
        candidate: Value,
    },
    /// Remote peer asks to be told once media is flowing.
    Webrtcup {
        #[serde(deserialize_with = "flexible_id")]
        id: String,
    },
    Answer {
        #[serde(deserialize_with = "flexible_id")]
        id: String,
        jsep: Value,
    },
    Ack {
        #[serde(deserialize_with = "flexible_id")]
        id: String,
    },
}

impl HandshakeMessage {
    pub fn id(&self) -> &str {
        match self {
            HandshakeMessage::Offer { id, .. }
            | HandshakeMessage::Trickle { id, .. }
            | HandshakeMessage::Webrtcup { id }
            | HandshakeMessage::Answer { id, .. }
            | HandshakeMessage::Ack { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeMessage::Offer { .. } => "offer",
            HandshakeMessage::Trickle { .. } => "trickle",
            HandshakeMessage::Webrtcup { .. } => "webrtcup",
            HandshakeMessage::Answer { .. } => "answer",
            HandshakeMessage::Ack { .. } => "ack",
        }
    }

    pub fn ack(id: impl Into<String>) -> Self {
        HandshakeMessage::Ack { id: id.into() }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct IdVisitor;

    impl<'de> Visitor<'de> for IdVisitor {
        type Value = String;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a string or numeric message id")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<String, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(IdVisitor)
}
