//! Cloud side of hub remote access.
//!
//! [`CloudConnector`] registers the device with the cloud broker, keeps the
//! session alive, pairs users and relays signaling messages. Transport is
//! abstracted behind [`BrokerLink`]: [`MqttLink`] talks to a real broker and
//! [`BusLink`] to an in-process [`transport_bus::LocalBus`].

pub mod bus_link;
pub mod connector;
pub mod dedup;
pub mod error;
pub mod link;
pub mod messages;
pub mod mock;
pub mod mqtt;
pub mod packets;
pub mod pairing;
pub mod reconnect;
pub mod store;
pub mod topics;
pub mod turn;

pub use bus_link::BusLink;
pub use connector::{
    CloudConnector, CloudEvent, CloudSettings, ConnectionState, PairingOutcome, PushEndpoint,
};
pub use error::{CloudError, LinkError};
pub use link::{BrokerLink, BrokerTarget, Completion, LinkEvent, RequestId, TlsMaterial};
pub use mqtt::MqttLink;
pub use store::{IdentityStore, MemoryIdentityStore, StoredIdentity};

#[cfg(test)]
mod tests;
