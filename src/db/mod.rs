pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use sqlite_vec::sqlite3_vec_init;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};

use crate::error::LayerError;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the shared Strata database at the given path, with all
/// extensions loaded and schema initialized.
///
/// Several channel processes open the same file; WAL plus a busy timeout lets
/// their writers queue instead of failing, and `synchronous=FULL` makes every
/// committed append durable before the call returns.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;

    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&mut conn).context("failed to run migrations")?;

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open an in-memory database with schema and migrations applied.
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let mut conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    schema::init_schema(&conn).context("failed to initialize schema")?;
    migrations::run_migrations(&mut conn).context("failed to run migrations")?;
    Ok(conn)
}

/// Shared handle to one SQLite connection.
///
/// Every component receives a clone at construction. Blocking SQLite work runs
/// on the tokio blocking pool so async callers never stall the runtime.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Db {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = open_database(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(open_memory_database()?))
    }

    /// File backing this handle, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> crate::error::Result<T>
    where
        F: FnOnce(&mut Connection) -> crate::error::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| LayerError::Internal(format!("db lock poisoned: {e}")))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| LayerError::Internal(format!("db task failed: {e}")))?
    }

    /// Run `f` synchronously on the current thread. For CLI commands and tests.
    pub fn blocking<F, T>(&self, f: F) -> crate::error::Result<T>
    where
        F: FnOnce(&mut Connection) -> crate::error::Result<T>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| LayerError::Internal(format!("db lock poisoned: {e}")))?;
        f(&mut guard)
    }
}

/// Diagnostics returned by [`check_database_health`].
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub schema_version: u32,
    pub sqlite_vec_version: String,
    pub embedding_model: Option<String>,
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub event_count: u64,
    pub batch_count: u64,
    pub anchor_count: u64,
    pub entity_count: u64,
    pub edge_count: u64,
    pub crystal_count: u64,
    pub lock_count: u64,
}

pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let schema_version = migrations::get_schema_version(conn)?;
    let sqlite_vec_version: String = conn.query_row("SELECT vec_version()", [], |r| r.get(0))?;
    let embedding_model = migrations::get_embedding_model(conn)?;

    let integrity_details: String =
        conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
    let integrity_ok = integrity_details == "ok";

    let count = |table: &str| -> Result<u64> {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        Ok(n as u64)
    };

    Ok(HealthReport {
        schema_version,
        sqlite_vec_version,
        embedding_model,
        integrity_ok,
        integrity_details,
        event_count: count("events")?,
        batch_count: count("ingest_batches")?,
        anchor_count: count("anchors")?,
        entity_count: count("graph_entities")?,
        edge_count: count("graph_edges")?,
        crystal_count: count("crystals")?,
        lock_count: count("locks")?,
    })
}

/// Current UTC time in the fixed-width RFC 3339 form every table stores.
///
/// Millisecond precision and a `Z` suffix keep lexicographic and temporal order identical.
pub fn now_rfc3339() -> String {
    format_ts(chrono::Utc::now())
}

pub fn format_ts(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
