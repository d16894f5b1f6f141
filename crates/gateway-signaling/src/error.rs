use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to connect to gateway socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("gateway socket is not open")]
    NotConnected,
    #[error("failed to encode gateway request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("gateway connection closed")]
    Closed,
}
