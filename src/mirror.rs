//! Local mirror of server-owned collections.
//!
//! Each collection lives in its own table as `(id, data JSON)`. The pull
//! path only ever replaces tables wholesale (`replace_snapshot`); the
//! per-record writers below are used for optimistic writes made by the
//! queue clients and take a plain `&Connection` so they can run inside the
//! caller's transaction.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

use crate::collections::Collection;
use crate::db::{self, DbState};
use crate::error::CoreResult;
use crate::queue;

const META_LAST_SNAPSHOT_AT: &str = "last_snapshot_at";
const META_SNAPSHOT_TIMESTAMP: &str = "snapshot_timestamp";

/// Full dataset as returned by `GET /pos/sync`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub categories: Vec<Value>,
    #[serde(default)]
    pub products: Vec<Value>,
    #[serde(default)]
    pub services: Vec<Value>,
    #[serde(default)]
    pub customers: Vec<Value>,
    #[serde(default)]
    pub employees: Vec<Value>,
    /// product id -> stock quantity
    #[serde(default)]
    pub inventory: BTreeMap<String, Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl Snapshot {
    fn records(&self, collection: Collection) -> Vec<Value> {
        match collection {
            Collection::Categories => self.categories.clone(),
            Collection::Products => self.products.clone(),
            Collection::Services => self.services.clone(),
            Collection::Customers => self.customers.clone(),
            Collection::Employees => self.employees.clone(),
            Collection::Inventory => self
                .inventory
                .iter()
                .map(|(id, qty)| inventory_record(id, qty.clone()))
                .collect(),
        }
    }
}

/// In-memory view of the whole mirror, published after every refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorView {
    pub categories: Vec<Value>,
    pub products: Vec<Value>,
    pub services: Vec<Value>,
    pub customers: Vec<Value>,
    pub employees: Vec<Value>,
    pub inventory: BTreeMap<String, Value>,
    pub timestamp: Option<String>,
    /// True when this view was served from the local mirror because the
    /// server could not be reached.
    pub is_offline: bool,
}

impl MirrorView {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
            && self.products.is_empty()
            && self.services.is_empty()
            && self.customers.is_empty()
            && self.employees.is_empty()
            && self.inventory.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.categories.len()
            + self.products.len()
            + self.services.len()
            + self.customers.len()
            + self.employees.len()
            + self.inventory.len()
    }
}

// ---------------------------------------------------------------------------
// Record helpers
// ---------------------------------------------------------------------------

/// Resolve a record's id from `id`, falling back to `_id`. Numeric ids are
/// stringified; empty strings count as missing.
pub fn record_id(record: &Value) -> Option<String> {
    ["id", "_id"].iter().find_map(|key| match record.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Set both `id` and `_id` on an object payload. Non-objects are wrapped.
pub fn with_id_aliases(payload: Value, id: &str) -> Value {
    let mut obj = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    obj.insert("id".to_string(), Value::String(id.to_string()));
    obj.insert("_id".to_string(), Value::String(id.to_string()));
    Value::Object(obj)
}

fn inventory_record(id: &str, qty: Value) -> Value {
    let mut record = with_id_aliases(Value::Null, id);
    if let Value::Object(ref mut map) = record {
        map.insert("stock".to_string(), qty);
    }
    record
}

// ---------------------------------------------------------------------------
// Single-record writers (optimistic path)
// ---------------------------------------------------------------------------

/// Insert or replace one record. Returns the id it was stored under.
pub fn upsert_record(conn: &Connection, collection: Collection, record: &Value) -> CoreResult<Option<String>> {
    let Some(id) = record_id(record) else {
        warn!(collection = %collection, "mirror: record without id skipped");
        return Ok(None);
    };
    let data = serde_json::to_string(record)?;
    conn.execute(
        &format!(
            "INSERT INTO {table} (id, data, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            table = collection.table()
        ),
        params![id, data],
    )?;
    Ok(Some(id))
}

/// Remove one record. Missing rows are not an error.
pub fn remove_record(conn: &Connection, collection: Collection, id: &str) -> CoreResult<bool> {
    let removed = conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", collection.table()),
        params![id],
    )?;
    Ok(removed > 0)
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

fn list_with(conn: &Connection, collection: Collection) -> CoreResult<Vec<Value>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT id, data FROM {} ORDER BY rowid",
        collection.table()
    ))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter_map(|(id, data)| match serde_json::from_str::<Value>(&data) {
            Ok(v) => Some(v),
            Err(e) => {
                error!(collection = %collection, id = %id, "mirror row JSON parse error: {e}");
                None
            }
        })
        .collect())
}

/// All records of one collection, in insertion order.
pub fn list(db: &DbState, collection: Collection) -> CoreResult<Vec<Value>> {
    let conn = db.lock()?;
    list_with(&conn, collection)
}

/// One record by id.
pub fn get(db: &DbState, collection: Collection, id: &str) -> CoreResult<Option<Value>> {
    let conn = db.lock()?;
    let data: Option<String> = conn
        .query_row(
            &format!("SELECT data FROM {} WHERE id = ?1", collection.table()),
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(data.and_then(|s| match serde_json::from_str::<Value>(&s) {
        Ok(v) => Some(v),
        Err(e) => {
            error!(collection = %collection, id = %id, "mirror row JSON parse error: {e}");
            None
        }
    }))
}

pub fn count(conn: &Connection, collection: Collection) -> CoreResult<i64> {
    Ok(conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", collection.table()),
        [],
        |row| row.get(0),
    )?)
}

pub fn is_empty(db: &DbState) -> CoreResult<bool> {
    let conn = db.lock()?;
    for collection in Collection::ALL {
        if count(&conn, collection)? > 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Read the whole mirror into a `MirrorView` (with `is_offline = false`;
/// the reconciler sets the flag).
pub fn load_view(db: &DbState) -> CoreResult<MirrorView> {
    let conn = db.lock()?;
    let inventory = list_with(&conn, Collection::Inventory)?
        .into_iter()
        .filter_map(|record| {
            let id = record_id(&record)?;
            Some((id, record.get("stock").cloned().unwrap_or(Value::Null)))
        })
        .collect();

    Ok(MirrorView {
        categories: list_with(&conn, Collection::Categories)?,
        products: list_with(&conn, Collection::Products)?,
        services: list_with(&conn, Collection::Services)?,
        customers: list_with(&conn, Collection::Customers)?,
        employees: list_with(&conn, Collection::Employees)?,
        inventory,
        timestamp: db::get_meta(&conn, META_SNAPSHOT_TIMESTAMP),
        is_offline: false,
    })
}

pub fn last_snapshot_at(db: &DbState) -> CoreResult<Option<String>> {
    let conn = db.lock()?;
    Ok(db::get_meta(&conn, META_LAST_SNAPSHOT_AT))
}

// ---------------------------------------------------------------------------
// Wholesale replace (pull path)
// ---------------------------------------------------------------------------

/// Replace every mirror table with the snapshot contents in one transaction,
/// then re-apply still-pending mutations on top so optimistic local state
/// survives the refresh. Returns the number of snapshot rows written.
pub fn replace_snapshot(db: &DbState, snapshot: &Snapshot) -> CoreResult<usize> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    let mut written = 0usize;

    for collection in Collection::ALL {
        tx.execute(&format!("DELETE FROM {}", collection.table()), [])?;
        for record in snapshot.records(collection) {
            if upsert_record(&tx, collection, &record)?.is_some() {
                written += 1;
            }
        }
    }

    let reapplied = queue::reapply_pending_mutations(&tx)?;

    db::set_meta(&tx, META_LAST_SNAPSHOT_AT, &Utc::now().to_rfc3339())?;
    match snapshot.timestamp.as_deref() {
        Some(ts) if !ts.trim().is_empty() => db::set_meta(&tx, META_SNAPSHOT_TIMESTAMP, ts)?,
        _ => {
            tx.execute(
                "DELETE FROM sync_meta WHERE meta_key = ?1",
                params![META_SNAPSHOT_TIMESTAMP],
            )?;
        }
    }

    tx.commit()?;
    debug!(rows = written, reapplied, "mirror: snapshot replaced");
    Ok(written)
}
