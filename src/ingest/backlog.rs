//! Which raw events have reached the knowledge graph.
//!
//! Every drain works on a contiguous id range recorded in `ingest_batches`.
//! A row with `completed_at IS NULL` is a claim held by one drainer; a row with
//! `completed_at` set is a finished batch. Claims are cut inside an IMMEDIATE
//! transaction so two drainers, in any process, always get disjoint ranges.
//! Claims whose holder went quiet for longer than the claim TTL are handed to
//! the next taker unchanged, which keeps the covered ranges gap-free.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::db::{self, Db};
use crate::error::{LayerError, Result};
use crate::layers::raw::{events_in_range, max_event_id, Event};

/// `claimed_at` stamped on released claims so they sort as long expired.
const RELEASED_AT: &str = "1970-01-01T00:00:00.000Z";

#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub id: i64,
    pub start_id: i64,
    pub end_id: i64,
    pub holder: String,
    pub channels: Vec<String>,
    pub claimed_at: String,
    pub completed_at: Option<String>,
}

/// A range of events handed to one drainer.
#[derive(Debug, Clone, Serialize)]
pub struct Claim {
    pub id: i64,
    pub start_id: i64,
    pub end_id: i64,
    /// True when this range was abandoned by an earlier holder.
    pub reissued: bool,
    pub events: Vec<Event>,
}

impl Claim {
    /// Distinct channels in the claimed events, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.events.iter().map(|e| e.channel.clone()).collect();
        channels.sort();
        channels.dedup();
        channels
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BacklogStats {
    pub pending: u64,
    pub max_event_id: i64,
    /// Highest event id inside a completed batch.
    pub batched_through: i64,
    pub completed_batches: u64,
    pub open_claims: u64,
    pub last_batch: Option<BatchRecord>,
}

fn batch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BatchRecord> {
    let channels: Option<String> = row.get(4)?;
    Ok(BatchRecord {
        id: row.get(0)?,
        start_id: row.get(1)?,
        end_id: row.get(2)?,
        holder: row.get(3)?,
        channels: channels
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default(),
        claimed_at: row.get(5)?,
        completed_at: row.get(6)?,
    })
}

fn batched_through(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(end_id), 0) FROM ingest_batches WHERE completed_at IS NOT NULL",
        [],
        |r| r.get(0),
    )?)
}

/// Highest end id over claims and completed batches alike.
fn covered_through(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COALESCE(MAX(end_id), 0) FROM ingest_batches", [], |r| r.get(0))?)
}

/// `max(event.id) - max(event.id in a completed batch)`, never negative.
pub fn count_pending(conn: &Connection) -> Result<u64> {
    let pending = max_event_id(conn)? - batched_through(conn)?;
    Ok(pending.max(0) as u64)
}

/// Claim the oldest un-batched events, at most `limit`. Returns `None` when
/// there is nothing to do.
pub fn take_batch(
    conn: &mut Connection,
    limit: usize,
    holder: &str,
    claim_ttl: Duration,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Option<Claim>> {
    if limit == 0 {
        return Err(LayerError::InvalidInput("batch limit must be positive".into()));
    }
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let now_ts = db::format_ts(now);
    let ttl = chrono::Duration::from_std(claim_ttl)
        .map_err(|e| LayerError::InvalidInput(format!("claim ttl out of range: {e}")))?;
    let cutoff = db::format_ts(now - ttl);

    let stale: Option<(i64, i64, i64)> = tx
        .query_row(
            "SELECT id, start_id, end_id FROM ingest_batches \
             WHERE completed_at IS NULL AND claimed_at <= ?1 ORDER BY start_id LIMIT 1",
            params![cutoff],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    let claim = if let Some((id, start_id, end_id)) = stale {
        tx.execute(
            "UPDATE ingest_batches SET holder = ?1, claimed_at = ?2 WHERE id = ?3",
            params![holder, now_ts, id],
        )?;
        Claim {
            id,
            start_id,
            end_id,
            reissued: true,
            events: events_in_range(&tx, start_id, end_id)?,
        }
    } else {
        let next = covered_through(&tx)? + 1;
        let bounds: Option<(i64, i64)> = tx
            .query_row(
                "SELECT MIN(id), MAX(id) FROM (SELECT id FROM events WHERE id >= ?1 ORDER BY id LIMIT ?2)",
                params![next, limit as i64],
                |r| Ok((r.get::<_, Option<i64>>(0)?, r.get::<_, Option<i64>>(1)?)),
            )
            .map(|(lo, hi)| lo.zip(hi))?;
        let Some((start_id, end_id)) = bounds else {
            return Ok(None);
        };
        tx.execute(
            "INSERT INTO ingest_batches (start_id, end_id, holder, claimed_at) VALUES (?1, ?2, ?3, ?4)",
            params![start_id, end_id, holder, now_ts],
        )?;
        Claim {
            id: tx.last_insert_rowid(),
            start_id,
            end_id,
            reissued: false,
            events: events_in_range(&tx, start_id, end_id)?,
        }
    };

    tx.commit()?;
    debug!(claim = claim.id, start = claim.start_id, end = claim.end_id, reissued = claim.reissued, "batch claimed");
    Ok(Some(claim))
}

/// Record `[start_id, end_id]` as ingested. Completes the matching claim, or
/// records the range directly when it continues the covered prefix and nobody
/// claimed it. Anything overlapping another batch is a conflict.
pub fn mark_batched(
    conn: &mut Connection,
    start_id: i64,
    end_id: i64,
    channels: &[String],
    holder: &str,
) -> Result<i64> {
    if start_id < 1 || end_id < start_id {
        return Err(LayerError::InvalidInput(format!(
            "invalid batch range [{start_id}, {end_id}]"
        )));
    }
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let max_id = max_event_id(&tx)?;
    if end_id > max_id {
        return Err(LayerError::InvalidInput(format!(
            "batch end {end_id} is past the newest event {max_id}"
        )));
    }
    let now = db::now_rfc3339();
    let channels_json = serde_json::to_string(channels)?;

    let open_claim: Option<i64> = tx
        .query_row(
            "SELECT id FROM ingest_batches WHERE start_id = ?1 AND end_id = ?2 AND completed_at IS NULL",
            params![start_id, end_id],
            |r| r.get(0),
        )
        .optional()?;

    let batch_id = if let Some(id) = open_claim {
        tx.execute(
            "UPDATE ingest_batches SET completed_at = ?1, channels = ?2, holder = ?3 WHERE id = ?4",
            params![now, channels_json, holder, id],
        )?;
        id
    } else {
        let overlapping: i64 = tx.query_row(
            "SELECT COUNT(*) FROM ingest_batches WHERE start_id <= ?2 AND end_id >= ?1",
            params![start_id, end_id],
            |r| r.get(0),
        )?;
        if overlapping > 0 {
            return Err(LayerError::Conflict(format!(
                "range [{start_id}, {end_id}] overlaps an existing batch"
            )));
        }
        let expected = covered_through(&tx)? + 1;
        if start_id != expected {
            return Err(LayerError::Conflict(format!(
                "range must start at {expected}, got {start_id}"
            )));
        }
        tx.execute(
            "INSERT INTO ingest_batches (start_id, end_id, holder, channels, claimed_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![start_id, end_id, holder, channels_json, now],
        )?;
        tx.last_insert_rowid()
    };

    tx.commit()?;
    Ok(batch_id)
}

/// Give a claim back so the next taker re-issues it first.
pub fn release(conn: &Connection, claim_id: i64, holder: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE ingest_batches SET claimed_at = ?1 \
         WHERE id = ?2 AND holder = ?3 AND completed_at IS NULL",
        params![RELEASED_AT, claim_id, holder],
    )?;
    Ok(changed > 0)
}

pub fn list_batches(conn: &Connection, limit: usize) -> Result<Vec<BatchRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, start_id, end_id, holder, channels, claimed_at, completed_at \
         FROM ingest_batches ORDER BY start_id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], batch_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn stats(conn: &Connection) -> Result<BacklogStats> {
    let (completed, open): (i64, i64) = conn.query_row(
        "SELECT COUNT(completed_at), COUNT(*) - COUNT(completed_at) FROM ingest_batches",
        [],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let last_batch = conn
        .query_row(
            "SELECT id, start_id, end_id, holder, channels, claimed_at, completed_at \
             FROM ingest_batches WHERE completed_at IS NOT NULL ORDER BY completed_at DESC, id DESC LIMIT 1",
            [],
            batch_from_row,
        )
        .optional()?;
    Ok(BacklogStats {
        pending: count_pending(conn)?,
        max_event_id: max_event_id(conn)?,
        batched_through: batched_through(conn)?,
        completed_batches: completed as u64,
        open_claims: open as u64,
        last_batch,
    })
}

/// Async handle bound to one holder identity.
#[derive(Clone)]
pub struct BacklogTracker {
    db: Db,
    holder: String,
    claim_ttl: Duration,
}

impl BacklogTracker {
    pub fn new(db: Db, holder: impl Into<String>, claim_ttl: Duration) -> Self {
        Self {
            db,
            holder: holder.into(),
            claim_ttl,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn count_pending(&self) -> Result<u64> {
        self.db.call(|conn| count_pending(conn)).await
    }

    pub async fn take_batch(&self, limit: usize) -> Result<Option<Claim>> {
        let holder = self.holder.clone();
        let ttl = self.claim_ttl;
        self.db
            .call(move |conn| take_batch(conn, limit, &holder, ttl, chrono::Utc::now()))
            .await
    }

    pub async fn mark_batched(&self, start_id: i64, end_id: i64, channels: Vec<String>) -> Result<i64> {
        let holder = self.holder.clone();
        let id = self
            .db
            .call(move |conn| mark_batched(conn, start_id, end_id, &channels, &holder))
            .await?;
        info!(batch = id, start_id, end_id, "batch marked");
        Ok(id)
    }

    pub async fn release(&self, claim_id: i64) -> Result<bool> {
        let holder = self.holder.clone();
        self.db.call(move |conn| release(conn, claim_id, &holder)).await
    }

    pub async fn stats(&self) -> Result<BacklogStats> {
        self.db.call(|conn| stats(conn)).await
    }

    pub async fn batches(&self, limit: usize) -> Result<Vec<BatchRecord>> {
        self.db.call(move |conn| list_batches(conn, limit)).await
    }
}
