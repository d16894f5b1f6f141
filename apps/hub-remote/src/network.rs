use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const LOG: &str = "hub_remote::network";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Offline,
    Online,
}

/// Online iff some non-loopback interface has an address.
pub fn probe_interfaces() -> NetworkState {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) if interfaces.iter().any(|iface| !iface.is_loopback()) => {
            NetworkState::Online
        }
        Ok(_) => NetworkState::Offline,
        Err(err) => {
            warn!(target: LOG, error = %err, "failed to list network interfaces");
            NetworkState::Offline
        }
    }
}

/// Polls reachability on an interval and publishes transitions.
pub struct NetworkMonitor {
    state: watch::Receiver<NetworkState>,
    task: JoinHandle<()>,
}

impl NetworkMonitor {
    pub fn spawn(interval: Duration) -> Self {
        Self::spawn_with(interval, probe_interfaces)
    }

    pub fn spawn_with<F>(interval: Duration, mut probe: F) -> Self
    where
        F: FnMut() -> NetworkState + Send + 'static,
    {
        let initial = probe();
        debug!(target: LOG, state = ?initial, "initial network state");
        let (tx, rx) = watch::channel(initial);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let state = probe();
                let changed = tx.send_if_modified(|current| {
                    if *current == state {
                        return false;
                    }
                    *current = state;
                    true
                });
                if changed {
                    info!(target: LOG, ?state, "network state changed");
                }
                if tx.is_closed() {
                    break;
                }
            }
        });
        Self { state: rx, task }
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.state.clone()
    }

    pub fn current(&self) -> NetworkState {
        *self.state.borrow()
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test_timeout::tokio_timeout_test(5, paused)]
    async fn transitions_are_published() {
        let mut script = VecDeque::from([
            NetworkState::Offline,
            NetworkState::Offline,
            NetworkState::Online,
        ]);
        let monitor = NetworkMonitor::spawn_with(Duration::from_secs(10), move || {
            script.pop_front().unwrap_or(NetworkState::Online)
        });
        let mut rx = monitor.subscribe();
        assert_eq!(*rx.borrow_and_update(), NetworkState::Offline);

        rx.changed().await.expect("change");
        assert_eq!(*rx.borrow_and_update(), NetworkState::Online);
        assert_eq!(monitor.current(), NetworkState::Online);
    }
}
