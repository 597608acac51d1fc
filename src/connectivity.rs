//! Connectivity monitor.
//!
//! Link-layer signals only say the network interface is up, not that the
//! POS server is answering, so "online" here always means a health probe
//! succeeded. `link_down` is trusted immediately; `link_up` and the periodic
//! timer both go through `probe`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::RemoteApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(self) -> bool {
        self == ConnectivityState::Online
    }
}

pub struct ConnectivityMonitor {
    remote: Arc<dyn RemoteApi>,
    tx: watch::Sender<ConnectivityState>,
    /// Bumped on every state change. A probe whose epoch went stale while
    /// it waited on the server drops its result.
    epoch: AtomicU64,
    /// Bumped on every Offline -> Online change.
    reconnects: AtomicU64,
    probe_lock: AsyncMutex<()>,
    probe_interval: Duration,
    probe_timeout: Duration,
}

impl ConnectivityMonitor {
    /// Starts `Offline`; the first probe decides.
    pub fn new(remote: Arc<dyn RemoteApi>, probe_interval: Duration, probe_timeout: Duration) -> Self {
        let (tx, _rx) = watch::channel(ConnectivityState::Offline);
        Self {
            remote,
            tx,
            epoch: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            probe_lock: AsyncMutex::new(()),
            probe_interval,
            probe_timeout,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Receives every state transition. Repeated identical states are not
    /// re-announced.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Number of Offline -> Online transitions so far. Watch updates
    /// coalesce; this does not, so a quick flap is still visible.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Returns true if the state actually changed.
    fn set(&self, next: ConnectivityState) -> bool {
        self.set_unless_stale(next, None)
    }

    /// Apply `next` unless the state changed since epoch `seen`.
    fn set_unless_stale(&self, next: ConnectivityState, seen: Option<u64>) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if seen.is_some_and(|e| e != self.epoch.load(Ordering::SeqCst)) || *current == next {
                return false;
            }
            *current = next;
            self.epoch.fetch_add(1, Ordering::SeqCst);
            if next.is_online() {
                self.reconnects.fetch_add(1, Ordering::SeqCst);
            }
            true
        });
        if changed {
            info!(state = ?next, "connectivity changed");
        }
        changed
    }

    /// Override the state without probing.
    pub fn force(&self, state: ConnectivityState) {
        self.set(state);
    }

    /// The network interface went away. No probe needed, and any probe
    /// still in flight is superseded.
    pub fn link_down(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.set(ConnectivityState::Offline);
    }

    /// The network interface came back. Only a probe can say the server is
    /// reachable again.
    pub async fn link_up(&self) -> ConnectivityState {
        self.probe().await
    }

    /// Active reachability check, bounded by the probe timeout. Probes run
    /// one at a time; a result that arrives after a newer state change
    /// (e.g. `link_down` mid-probe) is discarded.
    pub async fn probe(&self) -> ConnectivityState {
        let _serial = self.probe_lock.lock().await;
        let started = self.epoch.load(Ordering::SeqCst);

        let next = match tokio::time::timeout(self.probe_timeout, self.remote.health()).await {
            Ok(Ok(())) => ConnectivityState::Online,
            Ok(Err(e)) => {
                debug!(error = %e, "health probe failed");
                ConnectivityState::Offline
            }
            Err(_) => {
                debug!(timeout_ms = self.probe_timeout.as_millis() as u64, "health probe timed out");
                ConnectivityState::Offline
            }
        };

        if !self.set_unless_stale(next, Some(started)) && self.epoch.load(Ordering::SeqCst) != started {
            debug!(result = ?next, "probe result superseded by a newer state change");
        }
        self.state()
    }

    /// Probe immediately, then every `probe_interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.probe_interval.as_secs(),
                "Connectivity monitor started"
            );
            let mut ticker = tokio::time::interval(self.probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.probe() => {}
                }
            }
            info!("Connectivity monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRemote, HealthMode};

    fn monitor(remote: Arc<FakeRemote>) -> ConnectivityMonitor {
        ConnectivityMonitor::new(remote, Duration::from_secs(20), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_probe_success_goes_online_and_notifies() {
        let remote = Arc::new(FakeRemote::new());
        let monitor = monitor(remote.clone());
        let mut rx = monitor.subscribe();
        assert!(!monitor.is_online());

        assert_eq!(monitor.probe().await, ConnectivityState::Online);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Online);
    }

    #[tokio::test]
    async fn test_non_2xx_probe_is_offline() {
        let remote = Arc::new(FakeRemote::new());
        let monitor = monitor(remote.clone());
        monitor.force(ConnectivityState::Online);

        remote.set_health(HealthMode::Down);
        assert_eq!(monitor.probe().await, ConnectivityState::Offline);
        assert!(!monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_times_out_to_offline() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_health(HealthMode::Hang);
        let monitor = monitor(remote.clone());
        monitor.force(ConnectivityState::Online);

        let started = tokio::time::Instant::now();
        assert_eq!(monitor.probe().await, ConnectivityState::Offline);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_link_down_is_immediate_and_link_up_probes() {
        let remote = Arc::new(FakeRemote::new());
        let monitor = monitor(remote.clone());
        monitor.force(ConnectivityState::Online);

        monitor.link_down();
        assert!(!monitor.is_online());
        assert_eq!(remote.health_calls(), 0);

        assert_eq!(monitor.link_up().await, ConnectivityState::Online);
        assert_eq!(remote.health_calls(), 1);
    }

    #[tokio::test]
    async fn test_same_state_is_not_reannounced() {
        let remote = Arc::new(FakeRemote::new());
        let monitor = monitor(remote.clone());
        let mut rx = monitor.subscribe();

        monitor.link_down();
        assert!(!rx.has_changed().unwrap());
        monitor.probe().await;
        rx.borrow_and_update();
        monitor.probe().await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_down_during_probe_wins() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_health_delay(Duration::from_secs(2));
        let monitor = Arc::new(monitor(remote.clone()));
        monitor.force(ConnectivityState::Online);

        let probing = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.probe().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        monitor.link_down();

        assert_eq!(probing.await.unwrap(), ConnectivityState::Offline);
        assert!(!monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_probes_run_in_order() {
        let remote = Arc::new(FakeRemote::new());
        remote.set_health(HealthMode::Down);
        remote.set_health_delay(Duration::from_secs(3));
        let monitor = Arc::new(monitor(remote.clone()));

        let first = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.probe().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        remote.set_health(HealthMode::Up);
        let second = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.probe().await }
        });

        assert_eq!(first.await.unwrap(), ConnectivityState::Offline);
        assert_eq!(second.await.unwrap(), ConnectivityState::Online);
        assert!(monitor.is_online());
        assert_eq!(remote.health_calls(), 2);
    }

    #[test]
    fn test_reconnect_count_survives_flaps() {
        let monitor = monitor(Arc::new(FakeRemote::new()));
        let mut rx = monitor.subscribe();

        monitor.force(ConnectivityState::Online);
        monitor.force(ConnectivityState::Offline);
        monitor.force(ConnectivityState::Online);

        // The watch only shows the latest value; the counter keeps both.
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Online);
        assert_eq!(monitor.reconnect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_probes_periodically_until_cancelled() {
        let remote = Arc::new(FakeRemote::new());
        let monitor = Arc::new(monitor(remote.clone()));
        let cancel = CancellationToken::new();
        let handle = monitor.clone().spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(45)).await;
        // t=0, t=20, t=40
        assert_eq!(remote.health_calls(), 3);
        assert!(monitor.is_online());

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(remote.health_calls(), 3);
    }
}
