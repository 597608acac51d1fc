//! Wires the sync core together and owns its background tasks.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{HttpRemote, RemoteApi};
use crate::config::CoreConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::db::{self, DbState};
use crate::error::CoreResult;
use crate::mutations::MutationClient;
use crate::orders::OrderClient;
use crate::reconciler::SyncReconciler;

pub struct PosEngine {
    db: Arc<DbState>,
    monitor: Arc<ConnectivityMonitor>,
    reconciler: Arc<SyncReconciler>,
    mutations: MutationClient,
    orders: OrderClient,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl PosEngine {
    /// Open the local database under `config.data_dir`, talk HTTP to
    /// `config.server_url`, and start the probe and reconcile loops.
    pub fn start(config: &CoreConfig) -> CoreResult<Self> {
        let db = Arc::new(db::init(&config.data_dir)?);
        let remote: Arc<dyn RemoteApi> = Arc::new(HttpRemote::new(config)?);
        info!(server = %config.server_url, data_dir = %config.data_dir.display(), "Starting sync engine");
        Ok(Self::with_remote(config, db, remote))
    }

    /// Same as `start` with an already-open database and remote.
    pub fn with_remote(config: &CoreConfig, db: Arc<DbState>, remote: Arc<dyn RemoteApi>) -> Self {
        let monitor = Arc::new(ConnectivityMonitor::new(
            remote.clone(),
            config.probe_interval(),
            config.probe_timeout(),
        ));
        let reconciler = Arc::new(SyncReconciler::new(
            db.clone(),
            remote.clone(),
            monitor.clone(),
            config.drain_interval(),
            config.stuck_after_attempts,
        ));
        let mutations = MutationClient::new(db.clone(), remote.clone(), monitor.clone());
        let orders = OrderClient::new(db.clone(), remote, monitor.clone());

        let cancel = CancellationToken::new();
        let tasks = vec![
            monitor.clone().spawn(cancel.child_token()),
            reconciler.clone().spawn(cancel.child_token()),
        ];

        Self {
            db,
            monitor,
            reconciler,
            mutations,
            orders,
            cancel,
            tasks,
        }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    pub fn reconciler(&self) -> &Arc<SyncReconciler> {
        &self.reconciler
    }

    pub fn mutations(&self) -> &MutationClient {
        &self.mutations
    }

    pub fn orders(&self) -> &OrderClient {
        &self.orders
    }

    /// Stop background tasks and wait for them to exit. Queued work stays
    /// in the database for the next start.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {e}");
            }
        }
        info!("Sync engine stopped");
    }
}
