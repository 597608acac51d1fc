//! Local SQLite database layer for the sync core.
//!
//! Uses rusqlite with WAL mode. Holds the mirror tables (one per server
//! collection), the two write queues (`orders`, `mutations`) and a small
//! `sync_meta` key/value table. The store is constructed once at startup and
//! shared as `Arc<DbState>`; there is no process-global connection.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{CoreError, CoreResult};

/// Shared handle to the local store.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection. Never hold the guard across an `.await`.
    pub fn lock(&self) -> CoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| CoreError::Lock(e.to_string()))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

const DB_FILE_NAME: &str = "pos-sync.db";

/// Initialize the database at `{data_dir}/pos-sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. Only a corrupt file is set aside
/// (renamed to `pos-sync.db.corrupt-<ts>`) before one retry. Any other
/// open failure, such as a lock held by another process, is returned
/// untouched: the file holds the write queues.
pub fn init(data_dir: &Path) -> CoreResult<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) if is_corruption(&first_err) => {
            warn!("Database is corrupt ({first_err}), setting it aside and retrying once");
            quarantine(&db_path)?;
            open_and_configure(&db_path)?
        }
        Err(e) => {
            error!("Database open failed: {e}");
            return Err(e);
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

fn is_corruption(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::Database(rusqlite::Error::SqliteFailure(e, _))
            if matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            )
    )
}

/// Move a corrupt database and its WAL/SHM side files out of the way.
fn quarantine(db_path: &Path) -> CoreResult<()> {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    for suffix in ["", "-wal", "-shm"] {
        let mut from = db_path.as_os_str().to_owned();
        from.push(suffix);
        let from = PathBuf::from(from);
        if !from.exists() {
            continue;
        }
        let mut to = db_path.as_os_str().to_owned();
        to.push(format!("{suffix}.corrupt-{stamp}"));
        fs::rename(&from, &to)?;
        warn!("Moved {} aside to {}", from.display(), PathBuf::from(&to).display());
    }
    Ok(())
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> CoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    // Fail fast on a corrupt file so `init` can set it aside.
    let check: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    if check != "ok" {
        return Err(CoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CORRUPT),
            Some(check),
        )));
    }
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: mirror tables and sync metadata.
fn migrate_v1(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE TABLE IF NOT EXISTS products (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE TABLE IF NOT EXISTS services (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        CREATE TABLE IF NOT EXISTS employees (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );
        -- inventory: one row per product id, body {id, _id, stock}
        CREATE TABLE IF NOT EXISTS inventory (
            id TEXT PRIMARY KEY,
            data TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- sync_meta (last snapshot timestamp, last drain, ...)
        CREATE TABLE IF NOT EXISTS sync_meta (
            meta_key TEXT PRIMARY KEY,
            meta_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        CoreError::from(e)
    })?;

    info!("Applied migration v1 (mirror tables)");
    Ok(())
}

/// Migration v2: append-only write queues.
fn migrate_v2(conn: &Connection) -> CoreResult<()> {
    conn.execute_batch(
        "
        -- orders: completed sales tickets awaiting POST /tickets
        CREATE TABLE IF NOT EXISTS orders (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            temp_id TEXT UNIQUE NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'synced', 'error')),
            created_at TEXT NOT NULL,
            payload TEXT NOT NULL
        );

        -- mutations: collection writes made while offline
        CREATE TABLE IF NOT EXISTS mutations (
            local_id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL CHECK (kind IN ('create', 'update', 'delete')),
            collection TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'synced', 'error')),
            created_at TEXT NOT NULL,
            temp_id TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);
        CREATE INDEX IF NOT EXISTS idx_mutations_status ON mutations(status);
        CREATE INDEX IF NOT EXISTS idx_mutations_kind_collection_status_created
            ON mutations(kind, collection, status, created_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        CoreError::from(e)
    })?;

    info!("Applied migration v2 (orders + mutations queues)");
    Ok(())
}

/// Check whether a column already exists on a table.
fn column_exists(conn: &Connection, table: &str, column: &str) -> CoreResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().any(|n| n == column))
}

/// Migration v3: drain bookkeeping on both queues (attempts, last error,
/// synced timestamp). Status semantics are unchanged.
fn migrate_v3(conn: &Connection) -> CoreResult<()> {
    for table in ["orders", "mutations"] {
        if !column_exists(conn, table, "attempts")? {
            conn.execute_batch(&format!(
                "ALTER TABLE {table} ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;"
            ))?;
        }
        if !column_exists(conn, table, "last_error")? {
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN last_error TEXT;"))?;
        }
        if !column_exists(conn, table, "synced_at")? {
            conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN synced_at TEXT;"))?;
        }
    }
    conn.execute("INSERT INTO schema_version (version) VALUES (3)", [])?;

    info!("Applied migration v3 (queue attempt tracking)");
    Ok(())
}

// ---------------------------------------------------------------------------
// sync_meta helpers
// ---------------------------------------------------------------------------

pub fn get_meta(conn: &Connection, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT meta_value FROM sync_meta WHERE meta_key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
    .unwrap_or_else(|e| {
        warn!(key, error = %e, "sync_meta read failed");
        None
    })
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> CoreResult<()> {
    conn.execute(
        "INSERT INTO sync_meta (meta_key, meta_value, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(meta_key) DO UPDATE SET
            meta_value = excluded.meta_value,
            updated_at = excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// In-memory store with the full schema, for unit tests across the crate.
#[cfg(test)]
pub fn test_db() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
