//! Sync reconciler.
//!
//! Two independent jobs, both safe to call repeatedly:
//!
//! - `refresh`: pull `/pos/sync` and replace the mirror wholesale, or serve
//!   the existing mirror in degraded mode when the pull fails.
//! - `drain`: push every pending order and mutation, oldest first. Failed
//!   items stay `pending` for the next pass; one bad item never blocks the
//!   rest of the queue.
//!
//! `spawn` wires both to connectivity transitions and a periodic tick.

use chrono::Utc;
use reqwest::Method;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{RemoteApi, TICKETS_PATH};
use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
use crate::db::{self, DbState};
use crate::error::CoreResult;
use crate::mirror::{self, MirrorView};
use crate::mutations::{request_body, route};
use crate::queue::{self, MutationKind, PendingMutation, PendingOrder, QueueStats};

const META_LAST_DRAIN_AT: &str = "last_drain_at";
const EVENT_CAPACITY: usize = 64;

/// Notifications for whoever renders sync state (open-ticket lists,
/// offline banners, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    ConnectivityChanged {
        state: ConnectivityState,
    },
    #[serde(rename_all = "camelCase")]
    SnapshotRefreshed {
        degraded: bool,
        rows: usize,
    },
    #[serde(rename_all = "camelCase")]
    QueueDrained {
        orders_synced: usize,
        mutations_synced: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Mirror replaced from a fresh server snapshot.
    Refreshed { rows: usize },
    /// Server unreachable; serving the existing mirror.
    Degraded { rows: usize },
    /// Server unreachable and nothing cached locally.
    NoData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Another drain was already in flight; nothing was done.
    pub skipped: bool,
    pub requests: usize,
    pub orders_synced: usize,
    pub mutations_synced: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn changed(&self) -> usize {
        self.orders_synced + self.mutations_synced
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub degraded: bool,
    pub last_snapshot_at: Option<String>,
    pub last_drain_at: Option<String>,
    #[serde(flatten)]
    pub queue: QueueStats,
}

pub struct SyncReconciler {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteApi>,
    monitor: Arc<ConnectivityMonitor>,
    events: broadcast::Sender<SyncEvent>,
    view: watch::Sender<MirrorView>,
    drain_lock: AsyncMutex<()>,
    degraded: AtomicBool,
    drain_interval: Duration,
    stuck_after: i64,
}

impl SyncReconciler {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteApi>,
        monitor: Arc<ConnectivityMonitor>,
        drain_interval: Duration,
        stuck_after: i64,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (view, _) = watch::channel(MirrorView::default());
        Self {
            db,
            remote,
            monitor,
            events,
            view,
            drain_lock: AsyncMutex::new(()),
            degraded: AtomicBool::new(false),
            drain_interval,
            stuck_after,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Latest published mirror view.
    pub fn view(&self) -> watch::Receiver<MirrorView> {
        self.view.subscribe()
    }

    pub fn current_view(&self) -> MirrorView {
        self.view.borrow().clone()
    }

    /// True while the last refresh had to fall back to the local mirror.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Snapshot refresh
    // -----------------------------------------------------------------------

    pub async fn refresh(&self) -> CoreResult<RefreshOutcome> {
        match self.remote.fetch_snapshot().await {
            Ok(snapshot) => match mirror::replace_snapshot(&self.db, &snapshot) {
                Ok(rows) => {
                    let view = mirror::load_view(&self.db)?;
                    self.degraded.store(false, Ordering::SeqCst);
                    self.view.send_replace(view);
                    info!(rows, "Snapshot refreshed");
                    self.emit(SyncEvent::SnapshotRefreshed {
                        degraded: false,
                        rows,
                    });
                    return Ok(RefreshOutcome::Refreshed { rows });
                }
                Err(e) => error!("Snapshot write failed, keeping previous mirror: {e}"),
            },
            Err(e) => warn!(error = %e, "Snapshot fetch failed, serving local mirror"),
        }

        let mut view = mirror::load_view(&self.db)?;
        view.is_offline = true;
        let rows = view.row_count();
        let empty = view.is_empty();
        self.degraded.store(true, Ordering::SeqCst);
        self.view.send_replace(view);
        self.emit(SyncEvent::SnapshotRefreshed {
            degraded: true,
            rows,
        });

        if empty {
            warn!("No server snapshot and local mirror is empty: no data available");
            Ok(RefreshOutcome::NoData)
        } else {
            Ok(RefreshOutcome::Degraded { rows })
        }
    }

    // -----------------------------------------------------------------------
    // Queue draining
    // -----------------------------------------------------------------------

    /// Push all pending orders, then all pending mutations, oldest first.
    /// Concurrent callers do not wait: the loser returns `skipped`.
    pub async fn drain(&self) -> CoreResult<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already in flight, skipping");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        };

        let mut report = DrainReport::default();

        for order in queue::pending_orders(&self.db)? {
            self.drain_order(&order, &mut report).await?;
        }
        for mutation in queue::pending_mutations(&self.db)? {
            self.drain_mutation(&mutation, &mut report).await?;
        }

        if report.requests > 0 {
            let conn = self.db.lock()?;
            db::set_meta(&conn, META_LAST_DRAIN_AT, &Utc::now().to_rfc3339())?;
        }

        if report.changed() > 0 {
            info!(
                orders = report.orders_synced,
                mutations = report.mutations_synced,
                failed = report.failed,
                "Queue drained"
            );
            self.emit(SyncEvent::QueueDrained {
                orders_synced: report.orders_synced,
                mutations_synced: report.mutations_synced,
                failed: report.failed,
            });
        } else if report.failed > 0 {
            warn!(failed = report.failed, "Queue drain made no progress");
        }

        Ok(report)
    }

    async fn drain_order(&self, order: &PendingOrder, report: &mut DrainReport) -> CoreResult<()> {
        if let Some(err) = &order.payload_error {
            warn!(local_id = order.local_id, temp_id = %order.temp_id, "Order payload unreadable, leaving pending");
            queue::record_order_failure(&self.db, order.local_id, err)?;
            report.failed += 1;
            return Ok(());
        }

        report.requests += 1;
        match self
            .remote
            .send(Method::POST, TICKETS_PATH, Some(order.payload.clone()))
            .await
        {
            Ok(_) => {
                if queue::mark_order_synced(&self.db, order.local_id)? {
                    report.orders_synced += 1;
                }
            }
            Err(e) => {
                warn!(
                    local_id = order.local_id,
                    temp_id = %order.temp_id,
                    attempts = order.attempts + 1,
                    error = %e,
                    "Order sync failed, will retry"
                );
                queue::record_order_failure(&self.db, order.local_id, &e.to_string())?;
                report.failed += 1;
            }
        }
        Ok(())
    }

    async fn drain_mutation(&self, m: &PendingMutation, report: &mut DrainReport) -> CoreResult<()> {
        if let Some(err) = &m.payload_error {
            warn!(local_id = m.local_id, collection = %m.collection, "Mutation payload unreadable, leaving pending");
            queue::record_mutation_failure(&self.db, m.local_id, err)?;
            report.failed += 1;
            return Ok(());
        }

        let (method, path) = match route(m.collection, m.kind, &m.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(local_id = m.local_id, error = %e, "Mutation cannot be routed, leaving pending");
                queue::record_mutation_failure(&self.db, m.local_id, &e.to_string())?;
                report.failed += 1;
                return Ok(());
            }
        };

        report.requests += 1;
        match self
            .remote
            .send(method, &path, request_body(m.kind, &m.payload))
            .await
        {
            Ok(resp) => {
                if m.kind == MutationKind::Create {
                    warn_on_reassigned_id(m, &resp);
                }
                if queue::mark_mutation_synced(&self.db, m.local_id)? {
                    report.mutations_synced += 1;
                }
            }
            Err(e) => {
                warn!(
                    local_id = m.local_id,
                    collection = %m.collection,
                    kind = %m.kind,
                    attempts = m.attempts + 1,
                    error = %e,
                    "Mutation sync failed, will retry"
                );
                queue::record_mutation_failure(&self.db, m.local_id, &e.to_string())?;
                report.failed += 1;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn status(&self) -> CoreResult<SyncStatus> {
        let queue = queue::stats(&self.db, self.stuck_after)?;
        let last_drain_at = {
            let conn = self.db.lock()?;
            db::get_meta(&conn, META_LAST_DRAIN_AT)
        };
        Ok(SyncStatus {
            is_online: self.monitor.is_online(),
            degraded: self.is_degraded(),
            last_snapshot_at: mirror::last_snapshot_at(&self.db)?,
            last_drain_at,
            queue,
        })
    }

    // -----------------------------------------------------------------------
    // Background loop
    // -----------------------------------------------------------------------

    /// Refresh, then drain if the server is reachable.
    pub async fn sync_now(&self, reason: &str) {
        debug!(reason, "sync pass");
        if let Err(e) = self.refresh().await {
            error!(reason, "Snapshot refresh failed: {e}");
        }
        if self.monitor.is_online() {
            if let Err(e) = self.drain().await {
                error!(reason, "Queue drain failed: {e}");
            }
        }
    }

    /// Sync on start, on every transition to Online, and drain on each
    /// periodic tick while Online. Stops when `cancel` fires.
    ///
    /// Reconnects are tracked by the monitor's reconnect count rather than
    /// by comparing watch values, so a flap during a slow pass still
    /// triggers a fresh sync afterwards.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut connectivity = self.monitor.subscribe();
            connectivity.borrow_and_update();
            let mut seen_reconnects = self.monitor.reconnect_count();
            info!(
                interval_secs = self.drain_interval.as_secs(),
                "Sync reconciler started"
            );

            self.sync_now("startup").await;

            let mut ticker = tokio::time::interval(self.drain_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *connectivity.borrow_and_update();
                        self.emit(SyncEvent::ConnectivityChanged { state });
                        let reconnects = self.monitor.reconnect_count();
                        if reconnects != seen_reconnects {
                            seen_reconnects = reconnects;
                            if self.monitor.is_online() {
                                info!("Server reachable again; reconciling");
                                self.sync_now("reconnect").await;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if self.monitor.is_online() {
                            if let Err(e) = self.drain().await {
                                error!("Periodic drain failed: {e}");
                            }
                        }
                    }
                }
            }
            info!("Sync reconciler stopped");
        })
    }
}

/// Temp ids are not rewritten after a queued create syncs. Make the
/// mismatch visible so later writes against the temp id can be traced.
fn warn_on_reassigned_id(m: &PendingMutation, resp: &serde_json::Value) {
    let (Some(temp_id), Some(server_id)) = (m.temp_id.as_deref(), mirror::record_id(resp)) else {
        return;
    };
    if temp_id != server_id {
        warn!(
            collection = %m.collection,
            temp_id,
            server_id = %server_id,
            "Queued create synced under a server-assigned id; queued writes and mirror rows still use the temp id"
        );
    }
}
