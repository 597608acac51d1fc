//! Append-only write queues: `orders` (completed sales tickets) and
//! `mutations` (collection writes made while the server was unreachable).
//!
//! Rows are only ever inserted, flipped from `pending` to `synced`, or have
//! their attempt bookkeeping updated. Nothing here deletes a queue row.

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::collections::Collection;
use crate::db::DbState;
use crate::error::{CoreError, CoreResult};
use crate::mirror;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Synced,
    /// Reserved; the drain loop never assigns it.
    Error,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Synced => "synced",
            QueueStatus::Error => "error",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "synced" => Ok(QueueStatus::Synced),
            "error" => Ok(QueueStatus::Error),
            other => Err(CoreError::InvalidResponse(format!(
                "unknown queue status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(MutationKind::Create),
            "update" => Ok(MutationKind::Update),
            "delete" => Ok(MutationKind::Delete),
            other => Err(CoreError::InvalidResponse(format!(
                "unknown mutation kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub local_id: i64,
    pub temp_id: String,
    pub status: QueueStatus,
    pub created_at: String,
    pub payload: Value,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub synced_at: Option<String>,
    /// Set when the stored payload is not valid JSON; `payload` is then
    /// `Null` and the entry must not be sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    pub local_id: i64,
    pub kind: MutationKind,
    pub collection: Collection,
    pub payload: Value,
    pub status: QueueStatus,
    pub created_at: String,
    pub temp_id: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub synced_at: Option<String>,
    /// Set when the stored payload is not valid JSON; `payload` is then
    /// `Null` and the entry must not be sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_error: Option<String>,
}

/// Counts exposed through the sync status.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending_orders: i64,
    pub synced_orders: i64,
    pub pending_mutations: i64,
    pub synced_mutations: i64,
    pub stuck_orders: i64,
    pub stuck_mutations: i64,
}

/// Client-side identifier used before the server assigns a real one.
pub fn new_temp_id() -> String {
    format!("temp_{}", uuid::Uuid::new_v4().simple())
}

/// Microsecond precision keeps created_at ordering stable for bursts of
/// writes; ties still fall back to local_id.
fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_payload(raw: &str, local_id: i64) -> (Value, Option<String>) {
    match serde_json::from_str(raw) {
        Ok(v) => (v, None),
        Err(e) => {
            warn!(local_id, "queue payload JSON parse error: {e}");
            (Value::Null, Some(format!("unreadable payload: {e}")))
        }
    }
}

const ORDER_COLUMNS: &str =
    "local_id, temp_id, status, created_at, payload, attempts, last_error, synced_at";
const MUTATION_COLUMNS: &str = "local_id, kind, collection, payload, status, created_at, temp_id, attempts, last_error, synced_at";

type OrderRow = (i64, String, String, String, String, i64, Option<String>, Option<String>);

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<OrderRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn build_order(raw: OrderRow) -> CoreResult<PendingOrder> {
    let (local_id, temp_id, status, created_at, payload, attempts, last_error, synced_at) = raw;
    let (payload, payload_error) = parse_payload(&payload, local_id);
    Ok(PendingOrder {
        local_id,
        temp_id,
        status: status.parse()?,
        created_at,
        payload,
        attempts,
        last_error,
        synced_at,
        payload_error,
    })
}

type MutationRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<String>,
    Option<String>,
);

fn mutation_from_row(row: &Row<'_>) -> rusqlite::Result<MutationRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn build_mutation(raw: MutationRow) -> CoreResult<PendingMutation> {
    let (local_id, kind, collection, payload, status, created_at, temp_id, attempts, last_error, synced_at) =
        raw;
    let (payload, payload_error) = parse_payload(&payload, local_id);
    Ok(PendingMutation {
        local_id,
        kind: kind.parse()?,
        collection: collection.parse()?,
        payload,
        status: status.parse()?,
        created_at,
        temp_id,
        attempts,
        last_error,
        synced_at,
        payload_error,
    })
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Append a completed ticket to the order queue.
pub fn enqueue_order(db: &DbState, temp_id: &str, payload: &Value) -> CoreResult<PendingOrder> {
    let conn = db.lock()?;
    let created_at = now_timestamp();
    conn.execute(
        "INSERT INTO orders (temp_id, status, created_at, payload)
         VALUES (?1, 'pending', ?2, ?3)",
        params![temp_id, created_at, serde_json::to_string(payload)?],
    )?;
    let local_id = conn.last_insert_rowid();
    debug!(local_id, temp_id, "order queued");

    Ok(PendingOrder {
        local_id,
        temp_id: temp_id.to_string(),
        status: QueueStatus::Pending,
        created_at,
        payload: payload.clone(),
        attempts: 0,
        last_error: None,
        synced_at: None,
        payload_error: None,
    })
}

/// Pending orders, oldest first.
pub fn pending_orders(db: &DbState) -> CoreResult<Vec<PendingOrder>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         WHERE status = 'pending'
         ORDER BY created_at ASC, local_id ASC"
    ))?;
    let rows = stmt
        .query_map([], order_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(build_order).collect()
}

/// Every queued order (any status), newest first.
pub fn order_history(db: &DbState, limit: i64) -> CoreResult<Vec<PendingOrder>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {ORDER_COLUMNS} FROM orders
         ORDER BY created_at DESC, local_id DESC
         LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map(params![limit], order_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(build_order).collect()
}

/// Flip a pending order to `synced`. Returns false if it was not pending.
pub fn mark_order_synced(db: &DbState, local_id: i64) -> CoreResult<bool> {
    let conn = db.lock()?;
    let changed = conn.execute(
        "UPDATE orders
         SET status = 'synced', synced_at = ?2, attempts = attempts + 1, last_error = NULL
         WHERE local_id = ?1 AND status = 'pending'",
        params![local_id, now_timestamp()],
    )?;
    Ok(changed > 0)
}

/// Record a failed drain attempt. The order stays `pending`.
pub fn record_order_failure(db: &DbState, local_id: i64, error: &str) -> CoreResult<()> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE orders SET attempts = attempts + 1, last_error = ?2
         WHERE local_id = ?1 AND status = 'pending'",
        params![local_id, error],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// Apply the local equivalent of a mutation to the mirror.
pub fn apply_optimistic(
    conn: &Connection,
    collection: Collection,
    kind: MutationKind,
    payload: &Value,
) -> CoreResult<()> {
    match kind {
        MutationKind::Create | MutationKind::Update => {
            mirror::upsert_record(conn, collection, payload)?;
        }
        MutationKind::Delete => {
            if let Some(id) = mirror::record_id(payload) {
                mirror::remove_record(conn, collection, &id)?;
            }
        }
    }
    Ok(())
}

/// Append a mutation and apply it to the mirror in one transaction. The
/// payload must already carry its `id`/`_id`.
pub fn enqueue_mutation(
    db: &DbState,
    collection: Collection,
    kind: MutationKind,
    payload: &Value,
    temp_id: Option<&str>,
) -> CoreResult<PendingMutation> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    let created_at = now_timestamp();

    tx.execute(
        "INSERT INTO mutations (kind, collection, payload, status, created_at, temp_id)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
        params![
            kind.as_str(),
            collection.as_str(),
            serde_json::to_string(payload)?,
            created_at,
            temp_id
        ],
    )?;
    let local_id = tx.last_insert_rowid();
    apply_optimistic(&tx, collection, kind, payload)?;
    tx.commit()?;

    debug!(local_id, collection = %collection, kind = %kind, "mutation queued");

    Ok(PendingMutation {
        local_id,
        kind,
        collection,
        payload: payload.clone(),
        status: QueueStatus::Pending,
        created_at,
        temp_id: temp_id.map(str::to_string),
        attempts: 0,
        last_error: None,
        synced_at: None,
        payload_error: None,
    })
}

fn pending_mutations_with(conn: &Connection) -> CoreResult<Vec<PendingMutation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MUTATION_COLUMNS} FROM mutations
         WHERE status = 'pending'
         ORDER BY created_at ASC, local_id ASC"
    ))?;
    let rows = stmt
        .query_map([], mutation_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(build_mutation).collect()
}

/// Pending mutations across all collections, oldest first.
pub fn pending_mutations(db: &DbState) -> CoreResult<Vec<PendingMutation>> {
    let conn = db.lock()?;
    pending_mutations_with(&conn)
}

/// Re-apply every pending mutation to the mirror, in queue order. Used by
/// the snapshot refresh inside its transaction.
pub fn reapply_pending_mutations(conn: &Connection) -> CoreResult<usize> {
    let pending = pending_mutations_with(conn)?;
    let mut applied = 0;
    for m in pending.iter().filter(|m| m.payload_error.is_none()) {
        apply_optimistic(conn, m.collection, m.kind, &m.payload)?;
        applied += 1;
    }
    Ok(applied)
}

pub fn mark_mutation_synced(db: &DbState, local_id: i64) -> CoreResult<bool> {
    let conn = db.lock()?;
    let changed = conn.execute(
        "UPDATE mutations
         SET status = 'synced', synced_at = ?2, attempts = attempts + 1, last_error = NULL
         WHERE local_id = ?1 AND status = 'pending'",
        params![local_id, now_timestamp()],
    )?;
    Ok(changed > 0)
}

pub fn record_mutation_failure(db: &DbState, local_id: i64, error: &str) -> CoreResult<()> {
    let conn = db.lock()?;
    conn.execute(
        "UPDATE mutations SET attempts = attempts + 1, last_error = ?2
         WHERE local_id = ?1 AND status = 'pending'",
        params![local_id, error],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

fn count_where<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> i64 {
    conn.query_row(sql, params, |row| row.get(0))
        .unwrap_or_else(|e| {
            warn!("queue count failed: {e}");
            0
        })
}

/// Queue counters. An entry is "stuck" once it has failed at least
/// `stuck_after` drain attempts; it is still retried.
pub fn stats(db: &DbState, stuck_after: i64) -> CoreResult<QueueStats> {
    let conn = db.lock()?;
    Ok(QueueStats {
        pending_orders: count_where(&conn, "SELECT COUNT(*) FROM orders WHERE status = 'pending'", []),
        synced_orders: count_where(&conn, "SELECT COUNT(*) FROM orders WHERE status = 'synced'", []),
        pending_mutations: count_where(
            &conn,
            "SELECT COUNT(*) FROM mutations WHERE status = 'pending'",
            [],
        ),
        synced_mutations: count_where(
            &conn,
            "SELECT COUNT(*) FROM mutations WHERE status = 'synced'",
            [],
        ),
        stuck_orders: count_where(
            &conn,
            "SELECT COUNT(*) FROM orders WHERE status = 'pending' AND attempts >= ?1",
            params![stuck_after],
        ),
        stuck_mutations: count_where(
            &conn,
            "SELECT COUNT(*) FROM mutations WHERE status = 'pending' AND attempts >= ?1",
            params![stuck_after],
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use serde_json::json;

    #[test]
    fn test_enqueue_mutation_writes_queue_and_mirror_together() {
        let db = test_db();
        let payload = json!({ "id": "temp_1", "_id": "temp_1", "name": "Soap" });
        let queued =
            enqueue_mutation(&db, Collection::Products, MutationKind::Create, &payload, Some("temp_1"))
                .unwrap();
        assert_eq!(queued.status, QueueStatus::Pending);

        let pending = pending_mutations(&db).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, MutationKind::Create);
        assert_eq!(pending[0].collection, Collection::Products);
        assert_eq!(pending[0].temp_id.as_deref(), Some("temp_1"));

        let stored = mirror::get(&db, Collection::Products, "temp_1").unwrap();
        assert_eq!(stored.unwrap()["name"], "Soap");
    }

    #[test]
    fn test_enqueue_delete_removes_from_mirror() {
        let db = test_db();
        {
            let conn = db.lock().unwrap();
            mirror::upsert_record(&conn, Collection::Customers, &json!({ "id": "cu1" })).unwrap();
        }
        enqueue_mutation(
            &db,
            Collection::Customers,
            MutationKind::Delete,
            &json!({ "id": "cu1", "_id": "cu1" }),
            None,
        )
        .unwrap();
        assert!(mirror::get(&db, Collection::Customers, "cu1").unwrap().is_none());
    }

    #[test]
    fn test_pending_mutations_come_back_in_insertion_order() {
        let db = test_db();
        let first = json!({ "id": "temp_1", "_id": "temp_1", "name": "Soap" });
        let second = json!({ "id": "temp_1", "_id": "temp_1", "name": "Soap XL" });
        enqueue_mutation(&db, Collection::Products, MutationKind::Create, &first, Some("temp_1")).unwrap();
        enqueue_mutation(&db, Collection::Products, MutationKind::Update, &second, None).unwrap();

        let kinds: Vec<_> = pending_mutations(&db).unwrap().iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MutationKind::Create, MutationKind::Update]);
    }

    #[test]
    fn test_mark_synced_is_one_shot_and_keeps_row() {
        let db = test_db();
        let order = enqueue_order(&db, "temp_o1", &json!({ "total": 9.5 })).unwrap();

        assert!(mark_order_synced(&db, order.local_id).unwrap());
        assert!(!mark_order_synced(&db, order.local_id).unwrap());
        assert!(pending_orders(&db).unwrap().is_empty());

        let history = order_history(&db, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, QueueStatus::Synced);
        assert!(history[0].synced_at.is_some());
    }

    #[test]
    fn test_failures_keep_entry_pending_and_count_as_stuck() {
        let db = test_db();
        let order = enqueue_order(&db, "temp_o1", &json!({})).unwrap();
        for _ in 0..3 {
            record_order_failure(&db, order.local_id, "Server error (HTTP 503)").unwrap();
        }

        let pending = pending_orders(&db).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 3);
        assert_eq!(pending[0].last_error.as_deref(), Some("Server error (HTTP 503)"));

        let s = stats(&db, 3).unwrap();
        assert_eq!(s.pending_orders, 1);
        assert_eq!(s.stuck_orders, 1);
        assert_eq!(stats(&db, 4).unwrap().stuck_orders, 0);
    }

    #[test]
    fn test_reapply_pending_mutations_restores_optimistic_rows() {
        let db = test_db();
        let payload = json!({ "id": "temp_9", "_id": "temp_9", "name": "Walk-in" });
        enqueue_mutation(&db, Collection::Customers, MutationKind::Create, &payload, Some("temp_9")).unwrap();

        let conn = db.lock().unwrap();
        conn.execute("DELETE FROM customers", []).unwrap();
        assert_eq!(reapply_pending_mutations(&conn).unwrap(), 1);
        assert_eq!(mirror::count(&conn, Collection::Customers).unwrap(), 1);
    }

    #[test]
    fn test_temp_ids_are_unique_and_prefixed() {
        let a = new_temp_id();
        let b = new_temp_id();
        assert!(a.starts_with("temp_"));
        assert_ne!(a, b);
    }
}
