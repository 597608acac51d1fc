//! Mutation queue client: online-first collection writes with an offline
//! fallback.
//!
//! `submit` either lands a confirmed write on the server or queues a
//! `PendingMutation` plus the matching optimistic mirror write. Never both,
//! never neither.

use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::RemoteApi;
use crate::collections::Collection;
use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::mirror;
use crate::queue::{self, MutationKind};

/// What a write call hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitResult {
    pub success: bool,
    /// Server response when confirmed, otherwise the locally-stored payload.
    pub data: Value,
    /// True when the change is queued and not yet server-confirmed.
    pub offline: bool,
}

/// Resolve method and path for a mutation. Create goes to the collection
/// root; update and delete need an id from `id` or `_id`, sent as a single
/// percent-encoded path segment.
pub fn route(collection: Collection, kind: MutationKind, payload: &Value) -> CoreResult<(Method, String)> {
    let root = collection.rest_path();
    match kind {
        MutationKind::Create => Ok((Method::POST, root.to_string())),
        MutationKind::Update | MutationKind::Delete => {
            let id = mirror::record_id(payload).ok_or(CoreError::MissingId {
                collection: collection.as_str(),
                kind: kind.as_str(),
            })?;
            let method = if kind == MutationKind::Update {
                Method::PUT
            } else {
                Method::DELETE
            };
            Ok((method, format!("{root}/{}", urlencoding::encode(&id))))
        }
    }
}

/// Request body for a routed mutation. Deletes carry none.
pub fn request_body(kind: MutationKind, payload: &Value) -> Option<Value> {
    match kind {
        MutationKind::Delete => None,
        _ => Some(payload.clone()),
    }
}

pub struct MutationClient {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteApi>,
    monitor: Arc<ConnectivityMonitor>,
}

impl MutationClient {
    pub fn new(db: Arc<DbState>, remote: Arc<dyn RemoteApi>, monitor: Arc<ConnectivityMonitor>) -> Self {
        Self { db, remote, monitor }
    }

    /// Write `payload` to `collection`. Only a local storage failure is an
    /// error; server trouble turns into a queued, optimistic write.
    pub async fn submit(
        &self,
        collection: Collection,
        kind: MutationKind,
        payload: Value,
    ) -> CoreResult<SubmitResult> {
        if self.monitor.is_online() {
            match self.send_direct(collection, kind, &payload).await {
                Ok(data) => {
                    return Ok(SubmitResult {
                        success: true,
                        data,
                        offline: false,
                    })
                }
                Err(e) => {
                    warn!(
                        collection = %collection,
                        kind = %kind,
                        error = %e,
                        "direct write failed, queueing for later sync"
                    );
                }
            }
        }

        self.queue_offline(collection, kind, payload)
    }

    async fn send_direct(&self, collection: Collection, kind: MutationKind, payload: &Value) -> CoreResult<Value> {
        let (method, path) = route(collection, kind, payload)?;
        self.remote
            .send(method, &path, request_body(kind, payload))
            .await
    }

    fn queue_offline(&self, collection: Collection, kind: MutationKind, payload: Value) -> CoreResult<SubmitResult> {
        let (id, temp_id) = match mirror::record_id(&payload) {
            Some(id) => (id, None),
            None => {
                let temp = queue::new_temp_id();
                (temp.clone(), Some(temp))
            }
        };
        let payload = mirror::with_id_aliases(payload, &id);

        let queued = queue::enqueue_mutation(&self.db, collection, kind, &payload, temp_id.as_deref())?;
        info!(
            local_id = queued.local_id,
            collection = %collection,
            kind = %kind,
            id = %id,
            "write saved offline"
        );

        Ok(SubmitResult {
            success: true,
            data: payload,
            offline: true,
        })
    }
}
