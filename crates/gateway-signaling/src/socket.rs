//! Unix socket link to the gateway, one JSON object per line.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::GatewayError;
use crate::link::{GatewayInput, GatewayLink};

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/janusapi";

struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    alive: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn shutdown(self) {
        self.alive.store(false, Ordering::Release);
        for task in self.tasks {
            task.abort();
        }
    }
}

pub struct UnixSocketLink {
    path: PathBuf,
    input: mpsc::UnboundedSender<GatewayInput>,
    connection: Option<Connection>,
    generation: u64,
}

impl UnixSocketLink {
    pub fn new(path: impl Into<PathBuf>, input: mpsc::UnboundedSender<GatewayInput>) -> Self {
        Self {
            path: path.into(),
            input,
            connection: None,
            generation: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixSocketLink {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
    }
}

impl GatewayLink for UnixSocketLink {
    fn is_open(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.alive.load(Ordering::Acquire))
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn open(&mut self) -> Result<(), GatewayError> {
        if let Some(stale) = self.connection.take() {
            stale.shutdown();
        }
        let std_stream = std::os::unix::net::UnixStream::connect(&self.path).map_err(|source| {
            GatewayError::Connect {
                path: self.path.clone(),
                source,
            }
        })?;
        std_stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(std_stream)?;
        let (reader, mut writer) = stream.into_split();
        let generation = self.generation + 1;
        let alive = Arc::new(AtomicBool::new(true));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let input = self.input.clone();
        let reader_alive = Arc::clone(&alive);
        let read_task = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        trace!(target: "hub_remote::gateway", frame = %line, "received");
                        if input.send(GatewayInput::Frame(line)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(target: "hub_remote::gateway", "gateway closed the socket");
                        break;
                    }
                    Err(err) => {
                        warn!(target: "hub_remote::gateway", error = %err, "gateway socket read failed");
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::Release);
            let _ = input.send(GatewayInput::Closed { generation });
        });

        let writer_alive = Arc::clone(&alive);
        let write_task = tokio::spawn(async move {
            while let Some(mut frame) = outbound_rx.recv().await {
                frame.push('\n');
                if let Err(err) = writer.write_all(frame.as_bytes()).await {
                    warn!(target: "hub_remote::gateway", error = %err, "gateway socket write failed");
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
            writer_alive.store(false, Ordering::Release);
        });

        debug!(
            target: "hub_remote::gateway",
            path = %self.path.display(),
            generation,
            "gateway socket open"
        );
        self.generation = generation;
        self.connection = Some(Connection {
            outbound,
            alive,
            tasks: vec![read_task, write_task],
        });
        Ok(())
    }

    fn send(&mut self, frame: String) -> Result<(), GatewayError> {
        let connection = self.connection.as_ref().ok_or(GatewayError::NotConnected)?;
        if !connection.alive.load(Ordering::Acquire) {
            return Err(GatewayError::Closed);
        }
        connection
            .outbound
            .send(frame)
            .map_err(|_| GatewayError::Closed)
    }

    fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.shutdown();
        }
    }
}
