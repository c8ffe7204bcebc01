//! Best-effort cross-process locks with a TTL.
//!
//! Locks live in the shared SQLite file so every channel process sees the same
//! table. Acquisition never blocks; a crashed holder's lock simply expires and
//! the next `acquire` takes it over. This is coarse exclusion for maintenance
//! work (crystal rotation, drain scheduling), not consensus.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::db::{self, Db};
use crate::error::{LayerError, Result};

/// Lock names used inside the crate.
pub mod names {
    pub const CRYSTAL_ROTATE: &str = "crystals:rotate";
    pub const INGEST_DRAIN: &str = "ingest:drain";
}

#[derive(Debug, Clone, Serialize)]
pub struct LockInfo {
    pub name: String,
    pub holder: String,
    pub acquired_at: String,
    pub expires_at_ms: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn validate(name: &str, holder: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(LayerError::InvalidInput("lock name must not be empty".into()));
    }
    if holder.trim().is_empty() {
        return Err(LayerError::InvalidInput("lock holder must not be empty".into()));
    }
    Ok(())
}

/// Take `name` for `holder` if it is free, expired, or already held by `holder`.
pub fn acquire_at(conn: &Connection, name: &str, holder: &str, ttl: Duration, now_ms: i64) -> Result<bool> {
    validate(name, holder)?;
    let ttl_ms = ttl.as_millis() as i64;
    let changed = conn.execute(
        "INSERT INTO locks (name, holder, acquired_at, expires_at, ttl_ms) VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(name) DO UPDATE SET \
           holder = excluded.holder, acquired_at = excluded.acquired_at, \
           expires_at = excluded.expires_at, ttl_ms = excluded.ttl_ms \
         WHERE locks.expires_at <= ?6 OR locks.holder = excluded.holder",
        params![name, holder, db::now_rfc3339(), now_ms + ttl_ms, ttl_ms, now_ms],
    )?;
    Ok(changed > 0)
}

/// Extend a live lock by its original TTL. Fails if `holder` lost it.
pub fn renew_at(conn: &Connection, name: &str, holder: &str, now_ms: i64) -> Result<bool> {
    validate(name, holder)?;
    let changed = conn.execute(
        "UPDATE locks SET expires_at = ?3 + ttl_ms \
         WHERE name = ?1 AND holder = ?2 AND expires_at > ?3",
        params![name, holder, now_ms],
    )?;
    Ok(changed > 0)
}

/// Release `name` if `holder` holds it. Releasing someone else's lock is a no-op.
pub fn release(conn: &Connection, name: &str, holder: &str) -> Result<bool> {
    validate(name, holder)?;
    let changed = conn.execute(
        "DELETE FROM locks WHERE name = ?1 AND holder = ?2",
        params![name, holder],
    )?;
    Ok(changed > 0)
}

/// Drop every expired row. Purely housekeeping; expired locks are already free.
pub fn purge_expired_at(conn: &Connection, now_ms: i64) -> Result<usize> {
    Ok(conn.execute("DELETE FROM locks WHERE expires_at <= ?1", params![now_ms])?)
}

/// The live holder of `name`, if any.
pub fn current_at(conn: &Connection, name: &str, now_ms: i64) -> Result<Option<LockInfo>> {
    Ok(conn
        .query_row(
            "SELECT name, holder, acquired_at, expires_at FROM locks WHERE name = ?1 AND expires_at > ?2",
            params![name, now_ms],
            |row| {
                Ok(LockInfo {
                    name: row.get(0)?,
                    holder: row.get(1)?,
                    acquired_at: row.get(2)?,
                    expires_at_ms: row.get(3)?,
                })
            },
        )
        .optional()?)
}

/// Process-scoped handle: one holder identity, one default TTL.
#[derive(Clone)]
pub struct LockManager {
    db: Db,
    holder: String,
    default_ttl: Duration,
}

impl LockManager {
    pub fn new(db: Db, holder: impl Into<String>, default_ttl: Duration) -> Self {
        Self {
            db,
            holder: holder.into(),
            default_ttl,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub async fn acquire(&self, name: &str, ttl: Option<Duration>) -> Result<bool> {
        let (owned, holder) = (name.to_string(), self.holder.clone());
        let ttl = ttl.unwrap_or(self.default_ttl);
        let ok = self
            .db
            .call(move |conn| acquire_at(conn, &owned, &holder, ttl, now_ms()))
            .await?;
        debug!(lock = name, holder = %self.holder, acquired = ok, "lock acquire");
        Ok(ok)
    }

    pub async fn renew(&self, name: &str) -> Result<bool> {
        let (name, holder) = (name.to_string(), self.holder.clone());
        self.db
            .call(move |conn| renew_at(conn, &name, &holder, now_ms()))
            .await
    }

    pub async fn release(&self, name: &str) -> Result<bool> {
        let (name, holder) = (name.to_string(), self.holder.clone());
        self.db.call(move |conn| release(conn, &name, &holder)).await
    }

    pub async fn current(&self, name: &str) -> Result<Option<LockInfo>> {
        let name = name.to_string();
        self.db.call(move |conn| current_at(conn, &name, now_ms())).await
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        self.db.call(|conn| purge_expired_at(conn, now_ms())).await
    }
}
