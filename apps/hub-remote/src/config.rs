use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use cloud_link::link::parse_endpoint;
use cloud_link::{BrokerTarget, CloudError, CloudSettings, TlsMaterial};
use directories::ProjectDirs;
use gateway_signaling::protocol::DEFAULT_PLUGIN;
use gateway_signaling::{GatewaySettings, DEFAULT_SOCKET_PATH};

use crate::telemetry::{LogConfig, LogLevel};

pub const MACHINE_ID_PATH: &str = "/etc/machine-id";

#[derive(Debug, Parser)]
#[command(
    name = "hub-remote",
    author,
    version,
    about = "Remote access for the hub: cloud pairing and WebRTC signaling"
)]
pub struct Cli {
    /// Cloud broker: `host`, `host:port` or `mqtts://host:port`.
    #[arg(long, env = "HUB_REMOTE_CLOUD_ENDPOINT")]
    pub cloud_endpoint: Option<String>,

    /// Stable device id. Falls back to /etc/machine-id.
    #[arg(long, env = "HUB_REMOTE_DEVICE_ID")]
    pub device_id: Option<String>,

    /// Name shown to paired users.
    #[arg(long, env = "HUB_REMOTE_DEVICE_NAME", default_value = "Hub")]
    pub device_name: String,

    #[arg(long, env = "HUB_REMOTE_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    #[arg(long, env = "HUB_REMOTE_CLIENT_CERT")]
    pub client_cert: Option<PathBuf>,

    #[arg(long, env = "HUB_REMOTE_CLIENT_KEY")]
    pub client_key: Option<PathBuf>,

    /// Unix socket of the WebRTC gateway API.
    #[arg(long, env = "HUB_REMOTE_GATEWAY_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    pub gateway_socket: PathBuf,

    #[arg(long, env = "HUB_REMOTE_GATEWAY_PLUGIN", default_value = DEFAULT_PLUGIN)]
    pub gateway_plugin: String,

    /// Where registration state is kept. Defaults to the platform data dir.
    #[arg(long, env = "HUB_REMOTE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    #[arg(
        long,
        env = "HUB_REMOTE_CLOUD_ENABLED",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub cloud_enabled: bool,

    #[arg(long, env = "HUB_REMOTE_HEARTBEAT_SECS", default_value_t = 5)]
    pub heartbeat_secs: u64,

    #[arg(long, env = "HUB_REMOTE_PAIRING_TIMEOUT_SECS", default_value_t = 30)]
    pub pairing_timeout_secs: u64,

    #[arg(long, env = "HUB_REMOTE_GATEWAY_TIMEOUT_SECS", default_value_t = 30)]
    pub gateway_timeout_secs: u64,

    #[arg(long, env = "HUB_REMOTE_NETWORK_POLL_SECS", default_value_t = 10)]
    pub network_poll_secs: u64,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "HUB_REMOTE_METRICS_LISTEN")]
    pub metrics_listen: Option<String>,

    #[arg(long, env = "HUB_REMOTE_LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    #[arg(long, env = "HUB_REMOTE_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("remote access configuration incomplete: missing {}", .0.join(", "))]
    Incomplete(Vec<String>),
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

#[derive(Debug, Clone)]
pub struct RemoteAccessConfig {
    pub cloud_endpoint: Option<String>,
    pub device_id: Option<String>,
    pub device_name: String,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub gateway_socket: PathBuf,
    pub gateway_plugin: String,
    pub state_dir: PathBuf,
    pub cloud_enabled: bool,
    pub heartbeat_interval: Duration,
    pub pairing_timeout: Duration,
    pub gateway_request_timeout: Duration,
    pub network_poll_interval: Duration,
    pub metrics_listen: Option<SocketAddr>,
}

impl TryFrom<Cli> for RemoteAccessConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let metrics_listen = cli
            .metrics_listen
            .as_deref()
            .map(|raw| {
                raw.parse::<SocketAddr>()
                    .with_context(|| format!("invalid metrics listen address: {raw}"))
            })
            .transpose()?;
        if let Some(endpoint) = cli.cloud_endpoint.as_deref() {
            parse_endpoint(endpoint)
                .with_context(|| format!("invalid cloud endpoint: {endpoint}"))?;
        }
        let state_dir = match cli.state_dir {
            Some(dir) => dir,
            None => default_state_dir().context("unable to determine a state directory")?,
        };
        let device_id = cli
            .device_id
            .filter(|id| !id.trim().is_empty())
            .or_else(|| read_machine_id(Path::new(MACHINE_ID_PATH)));

        Ok(RemoteAccessConfig {
            cloud_endpoint: cli.cloud_endpoint.filter(|e| !e.trim().is_empty()),
            device_id,
            device_name: cli.device_name,
            ca_cert: cli.ca_cert,
            client_cert: cli.client_cert,
            client_key: cli.client_key,
            gateway_socket: cli.gateway_socket,
            gateway_plugin: cli.gateway_plugin,
            state_dir,
            cloud_enabled: cli.cloud_enabled,
            heartbeat_interval: Duration::from_secs(cli.heartbeat_secs.max(1)),
            pairing_timeout: Duration::from_secs(cli.pairing_timeout_secs),
            gateway_request_timeout: Duration::from_secs(cli.gateway_timeout_secs),
            network_poll_interval: Duration::from_secs(cli.network_poll_secs.max(1)),
            metrics_listen,
        })
    }
}

impl RemoteAccessConfig {
    /// Config with every optional input unset; useful as a base in tests.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            cloud_endpoint: None,
            device_id: None,
            device_name: "Hub".to_string(),
            ca_cert: None,
            client_cert: None,
            client_key: None,
            gateway_socket: PathBuf::from(DEFAULT_SOCKET_PATH),
            gateway_plugin: DEFAULT_PLUGIN.to_string(),
            state_dir: state_dir.into(),
            cloud_enabled: true,
            heartbeat_interval: Duration::from_secs(5),
            pairing_timeout: Duration::from_secs(30),
            gateway_request_timeout: Duration::from_secs(30),
            network_poll_interval: Duration::from_secs(10),
            metrics_listen: None,
        }
    }

    /// Everything that keeps remote access from starting.
    pub fn missing_items(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.device_id.is_none() {
            missing.push("device id".to_string());
        }
        if self.device_name.trim().is_empty() {
            missing.push("device name".to_string());
        }
        if self.cloud_endpoint.is_none() {
            missing.push("cloud endpoint".to_string());
        }
        for (label, path) in [
            ("CA certificate", &self.ca_cert),
            ("client certificate", &self.client_cert),
            ("client key", &self.client_key),
        ] {
            match path {
                None => missing.push(label.to_string()),
                Some(path) if !path.is_file() => {
                    missing.push(format!("{label} at {}", path.display()));
                }
                Some(_) => {}
            }
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_items().is_empty()
    }

    /// Resolve the broker target, reading the TLS material from disk.
    pub fn broker_target(&self) -> Result<BrokerTarget, ConfigError> {
        let missing = self.missing_items();
        let (Some(endpoint), Some(device_id), Some(ca), Some(cert), Some(key)) = (
            self.cloud_endpoint.as_deref(),
            self.device_id.as_deref(),
            self.ca_cert.as_deref(),
            self.client_cert.as_deref(),
            self.client_key.as_deref(),
        ) else {
            return Err(ConfigError::Incomplete(missing));
        };
        if !missing.is_empty() {
            return Err(ConfigError::Incomplete(missing));
        }
        let tls = TlsMaterial::load(ca, cert, key)?;
        Ok(BrokerTarget::new(endpoint, device_id)?.with_tls(tls))
    }

    pub fn cloud_settings(&self) -> CloudSettings {
        CloudSettings {
            pairing_timeout: self.pairing_timeout,
            ..CloudSettings::default()
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            plugin: self.gateway_plugin.clone(),
            request_timeout: self.gateway_request_timeout,
        }
    }
}

fn default_state_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "hub-remote").map(|dirs| dirs.data_dir().to_path_buf())
}

pub fn read_machine_id(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| machine_uuid(&raw))
}

/// Format a 32 hex digit machine id as a hyphenated UUID.
pub fn machine_uuid(raw: &str) -> Option<String> {
    let hex = raw.trim().to_ascii_lowercase();
    if hex.len() != 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_config(dir: &Path) -> RemoteAccessConfig {
        for name in ["ca.pem", "cert.pem", "key.pem"] {
            fs::write(dir.join(name), b"-----BEGIN TEST-----\n").expect("write pem");
        }
        RemoteAccessConfig {
            cloud_endpoint: Some("mqtts://broker.example.com:8884".into()),
            device_id: Some("dev-1".into()),
            ca_cert: Some(dir.join("ca.pem")),
            client_cert: Some(dir.join("cert.pem")),
            client_key: Some(dir.join("key.pem")),
            ..RemoteAccessConfig::new(dir)
        }
    }

    #[test_timeout::timeout]
    fn machine_id_becomes_uuid() {
        assert_eq!(
            machine_uuid("0123456789ABCDEF0123456789abcdef\n").as_deref(),
            Some("01234567-89ab-cdef-0123-456789abcdef")
        );
        assert_eq!(machine_uuid("0123"), None);
        assert_eq!(machine_uuid("g123456789abcdef0123456789abcdef"), None);
    }

    #[test_timeout::timeout]
    fn machine_id_read_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("machine-id");
        fs::write(&path, "ffffffffffffffffffffffffffffffff\n").expect("write");
        assert_eq!(
            read_machine_id(&path).as_deref(),
            Some("ffffffff-ffff-ffff-ffff-ffffffffffff")
        );
        assert_eq!(read_machine_id(&dir.path().join("absent")), None);
    }

    #[test_timeout::timeout]
    fn missing_items_are_listed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = RemoteAccessConfig::new(dir.path());
        config.device_name = " ".into();
        config.ca_cert = Some(dir.path().join("nope.pem"));
        let missing = config.missing_items();
        assert_eq!(missing.len(), 6);
        assert!(missing.contains(&"device id".to_string()));
        assert!(missing.contains(&"device name".to_string()));
        assert!(missing.iter().any(|item| item.starts_with("CA certificate at ")));
        assert!(matches!(
            config.broker_target(),
            Err(ConfigError::Incomplete(items)) if items.len() == 6
        ));
    }

    #[test_timeout::timeout]
    fn complete_config_builds_target() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = complete_config(dir.path());
        assert!(config.is_complete());
        let target = config.broker_target().expect("target");
        assert_eq!(target.host, "broker.example.com");
        assert_eq!(target.port, 8884);
        assert_eq!(target.client_id, "dev-1");
        assert!(target.tls.is_some());
    }

    #[test_timeout::timeout]
    fn cli_converts_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cli = Cli::try_parse_from([
            "hub-remote",
            "--device-id",
            "dev-9",
            "--cloud-endpoint",
            "broker.example.com",
            "--state-dir",
            dir.path().to_str().expect("utf8 path"),
            "--cloud-enabled",
            "false",
        ])
        .expect("parse");
        let config = RemoteAccessConfig::try_from(cli).expect("config");
        assert_eq!(config.device_id.as_deref(), Some("dev-9"));
        assert!(!config.cloud_enabled);
        assert_eq!(config.gateway_socket, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.gateway_settings().plugin, DEFAULT_PLUGIN);
    }

    #[test_timeout::timeout]
    fn bad_metrics_address_is_rejected() {
        let cli = Cli::try_parse_from([
            "hub-remote",
            "--state-dir",
            "/tmp",
            "--metrics-listen",
            "not-an-addr",
        ])
        .expect("parse");
        assert!(RemoteAccessConfig::try_from(cli).is_err());
    }
}
