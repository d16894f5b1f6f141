use crate::error::GatewayError;

/// What the gateway transport reports back. Delivered to the connector by
/// whoever owns the receiving end of the link's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayInput {
    Frame(String),
    /// The connection opened as `generation` is gone.
    Closed { generation: u64 },
}

pub trait GatewayLink: Send {
    fn is_open(&self) -> bool;
    /// Bumped by every successful [`open`](Self::open).
    fn generation(&self) -> u64;
    fn open(&mut self) -> Result<(), GatewayError>;
    /// Queue one frame; the link adds framing.
    fn send(&mut self, frame: String) -> Result<(), GatewayError>;
    fn close(&mut self);
}
