//! Topic layout shared with the cloud broker.
//!
//! Everything the device owns lives under its device id. Per-user signaling
//! happens below `<device>/<user>/...`; replies to a session go to
//! `<session topic>/reply`.

pub const CREATE_DEVICE: &str = "create/device";

const REPLY_SEGMENT: &str = "reply";
const PROXY_SEGMENT: &str = "proxy";

/// Where an inbound publish belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    /// Reply to a registration attempt; carries the ephemeral id.
    Registration(&'a str),
    UsersResponse,
    NameResponse,
    PairResponse,
    NotifyResponse,
    NotifyEndpoint,
    TurnResponse,
    /// Echo of something this device published to a `/reply` topic.
    OwnReply,
    /// Request for a proxied (non-WebRTC) remote connection.
    Proxy { user: &'a str },
    /// Signaling traffic on a user's topic tree.
    UserSignal { user: &'a str },
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Topics {
    device_id: String,
}

impl Topics {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn registration_response(&self, ephemeral_id: &str) -> String {
        format!("{CREATE_DEVICE}/{ephemeral_id}")
    }

    pub fn users(&self) -> String {
        format!("{}/device/users", self.device_id)
    }

    pub fn users_response(&self) -> String {
        format!("{}/device/users/response", self.device_id)
    }

    pub fn name(&self) -> String {
        format!("{}/device/name", self.device_id)
    }

    pub fn name_response(&self) -> String {
        format!("{}/device/name/response", self.device_id)
    }

    pub fn pair(&self) -> String {
        format!("{}/pair", self.device_id)
    }

    pub fn pair_response(&self) -> String {
        format!("{}/pair/response", self.device_id)
    }

    pub fn notify_user(&self, endpoint_id: &str) -> String {
        format!("{}/notify/user/{endpoint_id}", self.device_id)
    }

    pub fn notify_response(&self) -> String {
        format!("{}/notify/response", self.device_id)
    }

    pub fn notify_endpoint(&self) -> String {
        format!("{}/notify/info/endpoint", self.device_id)
    }

    pub fn turn(&self) -> String {
        format!("{}/services/turn", self.device_id)
    }

    pub fn turn_response(&self) -> String {
        format!("{}/services/turn/response", self.device_id)
    }

    pub fn user_tree(&self, user_id: &str) -> String {
        format!("{}/{user_id}/#", self.device_id)
    }

    /// Filters subscribed once the device is registered.
    pub fn setup_filters(&self) -> Vec<String> {
        vec![
            self.users_response(),
            self.name_response(),
            self.pair_response(),
            self.notify_response(),
            self.notify_endpoint(),
            self.turn_response(),
        ]
    }

    pub fn classify<'a>(&self, topic: &'a str) -> InboundTopic<'a> {
        if let Some(ephemeral) = topic
            .strip_prefix(CREATE_DEVICE)
            .and_then(|rest| rest.strip_prefix('/'))
        {
            if !ephemeral.is_empty() && !ephemeral.contains('/') {
                return InboundTopic::Registration(ephemeral);
            }
            return InboundTopic::Unknown;
        }

        let Some(rest) = topic
            .strip_prefix(self.device_id.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            return InboundTopic::Unknown;
        };

        match rest {
            "device/users/response" => return InboundTopic::UsersResponse,
            "device/name/response" => return InboundTopic::NameResponse,
            "pair/response" => return InboundTopic::PairResponse,
            "notify/response" => return InboundTopic::NotifyResponse,
            "notify/info/endpoint" => return InboundTopic::NotifyEndpoint,
            "services/turn/response" => return InboundTopic::TurnResponse,
            _ => {}
        }

        let mut levels = rest.split('/');
        let user = match levels.next() {
            Some(user) if !user.is_empty() => user,
            _ => return InboundTopic::Unknown,
        };
        let mut proxy = false;
        for level in levels {
            if level == REPLY_SEGMENT {
                return InboundTopic::OwnReply;
            }
            if level == PROXY_SEGMENT {
                proxy = true;
            }
        }
        if proxy {
            InboundTopic::Proxy { user }
        } else {
            InboundTopic::UserSignal { user }
        }
    }
}

/// Session replies are published next to the topic the session arrived on.
pub fn reply_topic(session_id: &str) -> String {
    format!("{session_id}/{REPLY_SEGMENT}")
}
