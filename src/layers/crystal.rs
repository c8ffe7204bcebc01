//! Crystallization layer: a chain of compressed period summaries.
//!
//! Summaries are produced elsewhere; this layer stores them, links each to the
//! one before it, and keeps only the newest `window` current. Older crystals are
//! archived (stamped with `archived_at`), never deleted.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{bands, with_deadline, Layer, LayerKind, Metadata, SearchResult};
use crate::config::CrystalConfig;
use crate::db::{self, Db};
use crate::error::{LayerError, Result};
use crate::lock::{names, LockManager};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crystal {
    pub seq: i64,
    pub summary: String,
    /// First and last raw event id covered, when known.
    pub span_start: Option<i64>,
    pub span_end: Option<i64>,
    pub predecessor: Option<i64>,
    pub created_at: String,
    pub archived_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrystalInput {
    pub summary: String,
    #[serde(default)]
    pub span_start: Option<i64>,
    #[serde(default)]
    pub span_end: Option<i64>,
}

impl CrystalInput {
    fn validate(&self) -> Result<()> {
        if self.summary.trim().is_empty() {
            return Err(LayerError::InvalidInput("crystal summary must not be empty".into()));
        }
        if let (Some(start), Some(end)) = (self.span_start, self.span_end) {
            if start > end {
                return Err(LayerError::InvalidInput(format!(
                    "span start {start} is after span end {end}"
                )));
            }
        }
        Ok(())
    }
}

const COLUMNS: &str = "seq, summary, span_start, span_end, predecessor, created_at, archived_at";

fn crystal_from_row(row: &Row<'_>) -> rusqlite::Result<Crystal> {
    Ok(Crystal {
        seq: row.get(0)?,
        summary: row.get(1)?,
        span_start: row.get(2)?,
        span_end: row.get(3)?,
        predecessor: row.get(4)?,
        created_at: row.get(5)?,
        archived_at: row.get(6)?,
    })
}

/// Append a crystal linked to the current newest one.
pub fn store_crystal(conn: &mut Connection, input: &CrystalInput) -> Result<Crystal> {
    input.validate()?;
    let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
    let predecessor: Option<i64> = tx.query_row("SELECT MAX(seq) FROM crystals", [], |r| r.get(0))?;
    let now = db::now_rfc3339();
    tx.execute(
        "INSERT INTO crystals (summary, span_start, span_end, predecessor, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![input.summary, input.span_start, input.span_end, predecessor, now],
    )?;
    let seq = tx.last_insert_rowid();
    tx.commit()?;
    Ok(Crystal {
        seq,
        summary: input.summary.clone(),
        span_start: input.span_start,
        span_end: input.span_end,
        predecessor,
        created_at: now,
        archived_at: None,
    })
}

/// Archive every current crystal except the newest `window`. Returns how many moved.
pub fn rotate(conn: &Connection, window: usize) -> Result<usize> {
    let moved = conn.execute(
        "UPDATE crystals SET archived_at = ?1 \
         WHERE archived_at IS NULL AND seq NOT IN \
           (SELECT seq FROM crystals WHERE archived_at IS NULL ORDER BY seq DESC LIMIT ?2)",
        params![db::now_rfc3339(), window as i64],
    )?;
    Ok(moved)
}

/// Newest first, never more than `window` even if a rotation is pending.
pub fn list_current(conn: &Connection, window: usize) -> Result<Vec<Crystal>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM crystals WHERE archived_at IS NULL ORDER BY seq DESC LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map(params![window as i64], crystal_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_archive(conn: &Connection, limit: usize, offset: usize) -> Result<Vec<Crystal>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM crystals WHERE archived_at IS NOT NULL \
         ORDER BY seq DESC LIMIT ?1 OFFSET ?2"
    ))?;
    let rows = stmt
        .query_map(params![limit as i64, offset as i64], crystal_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_crystal(conn: &Connection, seq: i64) -> Result<Option<Crystal>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM crystals WHERE seq = ?1"),
            params![seq],
            crystal_from_row,
        )
        .optional()?)
}

/// Follow predecessor links from `seq`, newest first, at most `max` links.
pub fn chain(conn: &Connection, seq: i64, max: usize) -> Result<Vec<Crystal>> {
    let mut out = Vec::new();
    let mut next = Some(seq);
    while let Some(current) = next {
        if out.len() >= max {
            break;
        }
        let Some(crystal) = get_crystal(conn, current)? else {
            break;
        };
        next = crystal.predecessor;
        out.push(crystal);
    }
    Ok(out)
}

pub fn count_current(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM crystals WHERE archived_at IS NULL",
        [],
        |r| r.get(0),
    )?;
    Ok(n as u64)
}

#[derive(Clone)]
pub struct CrystalLayer {
    db: Db,
    locks: LockManager,
    config: CrystalConfig,
}

impl CrystalLayer {
    pub fn new(db: Db, locks: LockManager, config: CrystalConfig) -> Self {
        Self { db, locks, config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    pub fn window(&self) -> usize {
        self.config.window
    }

    /// Store, then rotate if another process is not already rotating.
    pub async fn put(&self, input: CrystalInput) -> Result<Crystal> {
        let crystal = self.db.call(move |conn| store_crystal(conn, &input)).await?;
        info!(seq = crystal.seq, predecessor = ?crystal.predecessor, "crystal stored");
        if let Err(e) = self.rotate().await {
            warn!(error = %e, "crystal rotation failed, next store will retry");
        }
        Ok(crystal)
    }

    /// Count-based rotation under the `crystals:rotate` lock. Returns `None`
    /// when another holder has the lock.
    pub async fn rotate(&self) -> Result<Option<usize>> {
        if !self.locks.acquire(names::CRYSTAL_ROTATE, None).await? {
            debug!("crystal rotation skipped, lock held elsewhere");
            return Ok(None);
        }
        let window = self.config.window;
        let result = self.db.call(move |conn| rotate(conn, window)).await;
        self.locks.release(names::CRYSTAL_ROTATE).await?;
        let moved = result?;
        if moved > 0 {
            info!(moved, window, "crystals archived");
        }
        Ok(Some(moved))
    }

    pub async fn current(&self) -> Result<Vec<Crystal>> {
        let window = self.config.window;
        with_deadline(
            LayerKind::Crystal,
            self.timeout(),
            self.db.call(move |conn| list_current(conn, window)),
        )
        .await
    }

    pub async fn archive(&self, limit: usize, offset: usize) -> Result<Vec<Crystal>> {
        self.db
            .call(move |conn| list_archive(conn, limit, offset))
            .await
    }

    pub async fn get(&self, seq: i64) -> Result<Crystal> {
        self.db
            .call(move |conn| get_crystal(conn, seq))
            .await?
            .ok_or_else(|| LayerError::NotFound(format!("crystal {seq}")))
    }

    pub async fn chain(&self, seq: i64, max: usize) -> Result<Vec<Crystal>> {
        self.db.call(move |conn| chain(conn, seq, max)).await
    }
}

fn meta_i64(metadata: &Metadata, key: &str) -> Result<Option<i64>> {
    match metadata.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| LayerError::InvalidInput(format!("{key} must be an integer"))),
    }
}

#[async_trait]
impl Layer for CrystalLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Crystal
    }

    async fn store(&self, content: &str, metadata: &Metadata) -> Result<String> {
        let input = CrystalInput {
            summary: content.to_string(),
            span_start: meta_i64(metadata, "span_start")?,
            span_end: meta_i64(metadata, "span_end")?,
        };
        Ok(self.put(input).await?.seq.to_string())
    }

    /// Current crystals by recency. The query does not filter: current
    /// summaries are always part of the ambient picture.
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let mut crystals = self.current().await?;
        crystals.truncate(limit);
        Ok(crystals
            .into_iter()
            .enumerate()
            .map(|(i, c)| {
                let mut r = SearchResult::new(
                    LayerKind::Crystal,
                    c.seq.to_string(),
                    c.summary,
                    bands::stepped(bands::CRYSTAL, bands::CRYSTAL_STEP, i),
                )
                .with_meta("seq", c.seq)
                .with_meta("created_at", c.created_at);
                if let Some(p) = c.predecessor {
                    r = r.with_meta("predecessor", p);
                }
                if let (Some(s), Some(e)) = (c.span_start, c.span_end) {
                    r = r.with_meta("span_start", s).with_meta("span_end", e);
                }
                r
            })
            .collect())
    }
}
