//! Seam between the connector state machine and a broker transport.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::error::{CloudError, LinkError};

/// Correlates a publish or subscribe call with its acknowledgement.
pub type RequestId = u16;

pub const DEFAULT_PORT: u16 = 8883;

#[derive(Clone)]
pub struct TlsMaterial {
    pub ca: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl TlsMaterial {
    /// Reads the PEM files for mutual TLS.
    pub fn load(ca: &Path, client_cert: &Path, client_key: &Path) -> Result<Self, CloudError> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|source| CloudError::Tls {
                path: path.to_path_buf(),
                source,
            })
        };
        Ok(Self {
            ca: read(ca)?,
            client_cert: read(client_cert)?,
            client_key: read(client_key)?,
        })
    }
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca", &self.ca.len())
            .field("client_cert", &self.client_cert.len())
            .field("client_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BrokerTarget {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub tls: Option<TlsMaterial>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub max_backoff: Duration,
}

impl BrokerTarget {
    pub fn new(endpoint: &str, client_id: impl Into<String>) -> Result<Self, CloudError> {
        let (host, port) = parse_endpoint(endpoint)?;
        Ok(Self {
            host,
            port,
            client_id: client_id.into(),
            tls: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_backoff: Duration::from_secs(60),
        })
    }

    pub fn with_tls(mut self, tls: TlsMaterial) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Accepts `host`, `host:port` or an `mqtts://host[:port]` URL.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), CloudError> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(CloudError::InvalidEndpoint(endpoint.to_string()));
    }
    if trimmed.contains("://") {
        let url = Url::parse(trimmed)
            .map_err(|_| CloudError::InvalidEndpoint(endpoint.to_string()))?;
        match url.scheme() {
            "mqtts" | "ssl" | "tls" => {}
            other => return Err(CloudError::UnsupportedScheme(other.to_string())),
        }
        let host = url
            .host_str()
            .ok_or_else(|| CloudError::InvalidEndpoint(endpoint.to_string()))?;
        return Ok((host.to_string(), url.port().unwrap_or(DEFAULT_PORT)));
    }
    match trimmed.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port
                .parse()
                .map_err(|_| CloudError::InvalidEndpoint(endpoint.to_string()))?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err(CloudError::InvalidEndpoint(endpoint.to_string())),
        None => Ok((trimmed.to_string(), DEFAULT_PORT)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Published,
    Subscribed { granted: bool },
}

/// Everything a transport reports back to the connector.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    /// A connect attempt failed; the transport keeps retrying on its own.
    ConnectFailed { reason: String },
    /// An open session ended, either on request or because it dropped.
    Disconnected { reason: Option<String> },
    Completed {
        request: RequestId,
        completion: Completion,
    },
    Message { topic: String, payload: Bytes },
}

pub trait BrokerLink: Send {
    /// Start a session. Completion arrives as `LinkEvent::Connected`.
    fn connect(&mut self, target: &BrokerTarget) -> Result<(), LinkError>;
    /// End the session. Always followed by `LinkEvent::Disconnected`.
    fn disconnect(&mut self) -> Result<(), LinkError>;
    fn publish(&mut self, topic: &str, payload: Bytes) -> Result<RequestId, LinkError>;
    fn subscribe(&mut self, filters: &[String]) -> Result<RequestId, LinkError>;
}

/// Hands out non-zero request ids, wrapping at `u16::MAX`.
#[derive(Debug, Default)]
pub(crate) struct RequestIds {
    last: RequestId,
}

impl RequestIds {
    pub(crate) fn next(&mut self) -> RequestId {
        self.last = self.last.checked_add(1).unwrap_or(1);
        self.last
    }
}
