//! Order queue client.
//!
//! Completed sales tickets go to `POST /tickets` when the server is
//! reachable. Otherwise they are kept in the `orders` queue, which also
//! serves as local ticket history: synced rows are never removed.

use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{RemoteApi, TICKETS_PATH};
use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::CoreResult;
use crate::mutations::SubmitResult;
use crate::queue::{self, PendingOrder};

const DEFAULT_HISTORY_LIMIT: i64 = 200;

pub struct OrderClient {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteApi>,
    monitor: Arc<ConnectivityMonitor>,
}

impl OrderClient {
    pub fn new(db: Arc<DbState>, remote: Arc<dyn RemoteApi>, monitor: Arc<ConnectivityMonitor>) -> Self {
        Self { db, remote, monitor }
    }

    /// Submit a finalized ticket. Same contract as `MutationClient::submit`:
    /// always `success`, `offline` when queued.
    pub async fn submit(&self, ticket: Value) -> CoreResult<SubmitResult> {
        if self.monitor.is_online() {
            match self
                .remote
                .send(Method::POST, TICKETS_PATH, Some(ticket.clone()))
                .await
            {
                Ok(data) => {
                    return Ok(SubmitResult {
                        success: true,
                        data,
                        offline: false,
                    })
                }
                Err(e) => warn!(error = %e, "ticket submit failed, queueing for later sync"),
            }
        }

        let temp_id = queue::new_temp_id();
        let queued = queue::enqueue_order(&self.db, &temp_id, &ticket)?;
        info!(local_id = queued.local_id, temp_id = %temp_id, "ticket saved offline");

        Ok(SubmitResult {
            success: true,
            data: serde_json::json!({
                "tempId": queued.temp_id,
                "localId": queued.local_id,
                "ticket": ticket,
            }),
            offline: true,
        })
    }

    /// Orders still waiting for the server, oldest first.
    pub fn pending(&self) -> CoreResult<Vec<PendingOrder>> {
        queue::pending_orders(&self.db)
    }

    /// Queued tickets of any status, newest first.
    pub fn history(&self, limit: Option<i64>) -> CoreResult<Vec<PendingOrder>> {
        queue::order_history(&self.db, limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
    }
}
