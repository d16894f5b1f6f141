//! Local half of hub remote access: drives the WebRTC gateway over its unix
//! socket API.
//!
//! [`GatewayConnector`] turns remote peers' offers and ICE candidates into
//! gateway sessions and relays the gateway's answers and acknowledgements
//! back as [`HandshakeMessage`]s. It performs no I/O itself; a
//! [`GatewayLink`] carries the frames.

pub mod connector;
pub mod error;
pub mod handshake;
pub mod ids;
pub mod link;
pub mod mock;
pub mod protocol;
pub mod session;
pub mod socket;

pub use connector::{CloseReason, GatewayConnector, GatewayEvent, GatewaySettings};
pub use error::GatewayError;
pub use handshake::HandshakeMessage;
pub use link::{GatewayInput, GatewayLink};
pub use session::WebRtcSession;
pub use socket::{UnixSocketLink, DEFAULT_SOCKET_PATH};
