use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures reported synchronously by a [`crate::BrokerLink`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("no broker session is open")]
    NotConnected,
    #[error("broker client refused the request: {0}")]
    Rejected(String),
    #[error("bus error: {0}")]
    Bus(String),
}

impl From<transport_bus::BusError> for LinkError {
    fn from(value: transport_bus::BusError) -> Self {
        LinkError::Bus(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("invalid broker endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("unsupported endpoint scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("failed to read {path}: {source}")]
    Tls {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("link error: {0}")]
    Link(#[from] LinkError),
}
