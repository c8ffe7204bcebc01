//! Raw capture, the append-only source of truth for every channel's events.
//!
//! Ids come from SQLite's AUTOINCREMENT rowid, so they are monotonic across all
//! channels and every windowing query here is a pure function of id order.
//! Appends commit before returning; nothing is buffered.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{bands, meta_str, with_deadline, Layer, LayerKind, Metadata, SearchResult};
use crate::config::RawConfig;
use crate::db::{self, Db};
use crate::error::{LayerError, Result};
use crate::layers::graph::explore::RecentEvents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = LayerError;

    /// Accepts the generic actor/respondent vocabulary as well.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "actor" | "human" => Ok(Self::User),
            "assistant" | "respondent" | "agent" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "tool" => Ok(Self::Tool),
            _ => Err(LayerError::InvalidInput(format!("unknown role: {s}"))),
        }
    }
}

/// One captured interaction turn. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub channel: String,
    pub role: Role,
    pub content: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventInput {
    pub channel: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl EventInput {
    pub fn new(channel: &str, role: Role, content: &str) -> Self {
        Self {
            channel: channel.to_string(),
            role,
            content: content.to_string(),
            metadata: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.channel.trim().is_empty() {
            return Err(LayerError::InvalidInput("channel must not be empty".into()));
        }
        if self.content.trim().is_empty() {
            return Err(LayerError::InvalidInput("content must not be empty".into()));
        }
        Ok(())
    }
}

const EVENT_COLUMNS: &str = "id, channel, role, content, created_at, metadata";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let role: String = row.get(2)?;
    let metadata: Option<String> = row.get(5)?;
    Ok(Event {
        id: row.get(0)?,
        channel: row.get(1)?,
        role: role.parse().unwrap_or(Role::User),
        content: row.get(3)?,
        created_at: row.get(4)?,
        metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn collect_events(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(sql)?;
    let events = stmt
        .query_map(params, event_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

// ── Synchronous store operations ─────────────────────────────────────────────

/// Append one event and sync the FTS index in the same transaction.
pub fn append_event(conn: &mut Connection, input: &EventInput) -> Result<Event> {
    input.validate()?;
    let now = db::now_rfc3339();
    let metadata_json = input.metadata.as_ref().map(serde_json::to_string).transpose()?;

    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO events (channel, role, content, created_at, metadata) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![input.channel, input.role.as_str(), input.content, now, metadata_json],
    )?;
    let id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO events_fts (rowid, content) VALUES (?1, ?2)",
        params![id, input.content],
    )?;
    tx.commit()?;

    Ok(Event {
        id,
        channel: input.channel.clone(),
        role: input.role,
        content: input.content.clone(),
        created_at: now,
        metadata: input.metadata.clone(),
    })
}

pub fn get_event(conn: &Connection, id: i64) -> Result<Option<Event>> {
    Ok(conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
            params![id],
            event_from_row,
        )
        .optional()?)
}

/// Newest-first events, optionally restricted to one channel.
pub fn recent_events(conn: &Connection, limit: usize, channel: Option<&str>) -> Result<Vec<Event>> {
    match channel {
        Some(ch) => collect_events(
            conn,
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE channel = ?1 ORDER BY id DESC LIMIT ?2"),
            params![ch, limit as i64],
        ),
        None => collect_events(
            conn,
            &format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY id DESC LIMIT ?1"),
            params![limit as i64],
        ),
    }
}

/// Events strictly after `ts`, oldest first.
pub fn events_after(conn: &Connection, ts: &str, limit: usize) -> Result<Vec<Event>> {
    collect_events(
        conn,
        &format!("SELECT {EVENT_COLUMNS} FROM events WHERE created_at > ?1 ORDER BY id ASC LIMIT ?2"),
        params![ts, limit as i64],
    )
}

/// Reconstruct context around `center_ts`: `total` events split by `ratio`
/// into those at or before the center and those after it. Returned in id order.
///
/// When one side runs short the other side is not topped up; the window is
/// exactly what exists within each half.
pub fn events_around(conn: &Connection, center_ts: &str, total: usize, ratio: f64) -> Result<Vec<Event>> {
    let before = ((total as f64) * ratio.clamp(0.0, 1.0)).round() as usize;
    let after = total.saturating_sub(before);

    let mut window = collect_events(
        conn,
        &format!("SELECT {EVENT_COLUMNS} FROM events WHERE created_at <= ?1 ORDER BY id DESC LIMIT ?2"),
        params![center_ts, before as i64],
    )?;
    window.reverse();
    window.extend(collect_events(
        conn,
        &format!("SELECT {EVENT_COLUMNS} FROM events WHERE created_at > ?1 ORDER BY id ASC LIMIT ?2"),
        params![center_ts, after as i64],
    )?);
    Ok(window)
}

/// Keyword search over the newest `window` events, newest match first.
pub fn keyword_search(conn: &Connection, query: &str, limit: usize, window: usize) -> Result<Vec<Event>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }
    let floor = max_event_id(conn)? - window as i64;
    collect_events(
        conn,
        "SELECT e.id, e.channel, e.role, e.content, e.created_at, e.metadata \
         FROM events_fts f JOIN events e ON e.id = f.rowid \
         WHERE events_fts MATCH ?1 AND f.rowid > ?2 \
         ORDER BY e.id DESC LIMIT ?3",
        params![escaped, floor, limit as i64],
    )
}

/// Events with ids in `[start_id, end_id]`, in id order.
pub fn events_in_range(conn: &Connection, start_id: i64, end_id: i64) -> Result<Vec<Event>> {
    collect_events(
        conn,
        &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id BETWEEN ?1 AND ?2 ORDER BY id ASC"),
        params![start_id, end_id],
    )
}

pub fn max_event_id(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT COALESCE(MAX(id), 0) FROM events", [], |r| r.get(0))?)
}

pub fn count_events(conn: &Connection) -> Result<u64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
    Ok(n as u64)
}

/// Quote each whitespace-delimited word so FTS5 treats it as a plain term.
/// Terms are OR-ed: any matching word qualifies an event.
pub(crate) fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{w}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ── Layer ────────────────────────────────────────────────────────────────────

/// Async [`Layer`] over the raw event tables.
#[derive(Clone)]
pub struct RawCaptureLayer {
    db: Db,
    config: RawConfig,
}

impl RawCaptureLayer {
    pub fn new(db: Db, config: RawConfig) -> Self {
        Self { db, config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    pub async fn append(&self, input: EventInput) -> Result<Event> {
        // Appends are not deadline-bound: once queued they must land.
        let event = self.db.call(move |conn| append_event(conn, &input)).await?;
        tracing::debug!(id = event.id, channel = %event.channel, "event captured");
        Ok(event)
    }

    pub async fn recent(&self, limit: usize, channel: Option<String>) -> Result<Vec<Event>> {
        with_deadline(
            LayerKind::Raw,
            self.timeout(),
            self.db
                .call(move |conn| recent_events(conn, limit, channel.as_deref())),
        )
        .await
    }

    pub async fn after(&self, ts: String, limit: usize) -> Result<Vec<Event>> {
        with_deadline(
            LayerKind::Raw,
            self.timeout(),
            self.db.call(move |conn| events_after(conn, &ts, limit)),
        )
        .await
    }

    pub async fn around(&self, center_ts: String, total: usize, ratio: Option<f64>) -> Result<Vec<Event>> {
        let ratio = ratio.unwrap_or(self.config.around_ratio);
        with_deadline(
            LayerKind::Raw,
            self.timeout(),
            self.db
                .call(move |conn| events_around(conn, &center_ts, total, ratio)),
        )
        .await
    }

    pub async fn keyword(&self, query: String, limit: usize) -> Result<Vec<Event>> {
        let window = self.config.search_window;
        with_deadline(
            LayerKind::Raw,
            self.timeout(),
            self.db
                .call(move |conn| keyword_search(conn, &query, limit, window)),
        )
        .await
    }

    pub async fn max_id(&self) -> Result<i64> {
        self.db.call(|conn| max_event_id(conn)).await
    }
}

/// Time-window selection over raw events, used in place of a keyword query.
/// `after` lists events strictly after a timestamp; `center` rebuilds the
/// context around one, `total` events split by `ratio` before and after it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawWindow {
    pub after: Option<String>,
    pub center: Option<String>,
    pub total: Option<usize>,
    pub ratio: Option<f64>,
}

impl RawWindow {
    pub fn is_empty(&self) -> bool {
        self.after.is_none() && self.center.is_none() && self.total.is_none() && self.ratio.is_none()
    }
}

/// Parse any RFC 3339 timestamp into the stored millisecond UTC form, so
/// string comparison against `created_at` stays temporal.
fn normalize_ts(field: &str, ts: &str) -> Result<String> {
    chrono::DateTime::parse_from_rfc3339(ts.trim())
        .map(|t| db::format_ts(t.with_timezone(&chrono::Utc)))
        .map_err(|e| LayerError::InvalidInput(format!("{field} must be an RFC 3339 timestamp: {e}")))
}

impl RawCaptureLayer {
    /// Events selected by `window`, scored like any other raw hit.
    pub async fn window(&self, window: RawWindow, limit: usize) -> Result<Vec<SearchResult>> {
        let events = match (&window.after, &window.center) {
            (Some(_), Some(_)) => {
                return Err(LayerError::InvalidInput("use either after or center, not both".into()));
            }
            (Some(after), None) => {
                if window.total.is_some() || window.ratio.is_some() {
                    return Err(LayerError::InvalidInput("total and ratio only apply with center".into()));
                }
                self.after(normalize_ts("after", after)?, limit).await?
            }
            (None, Some(center)) => {
                let total = window.total.unwrap_or(limit).min(limit);
                if let Some(ratio) = window.ratio {
                    if !(0.0..=1.0).contains(&ratio) {
                        return Err(LayerError::InvalidInput("ratio must be between 0 and 1".into()));
                    }
                }
                self.around(normalize_ts("center", center)?, total, window.ratio).await?
            }
            (None, None) => {
                return Err(LayerError::InvalidInput("a raw window needs after or center".into()));
            }
        };
        Ok(events
            .into_iter()
            .enumerate()
            .map(|(i, e)| event_result(e, i))
            .collect())
    }
}

fn event_result(event: Event, index: usize) -> SearchResult {
    SearchResult::new(
        LayerKind::Raw,
        event.id.to_string(),
        event.content,
        bands::stepped(bands::RAW, bands::RAW_STEP, index),
    )
    .with_meta("channel", event.channel)
    .with_meta("role", event.role.as_str())
    .with_meta("created_at", event.created_at)
}

#[async_trait]
impl Layer for RawCaptureLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Raw
    }

    /// Requires `metadata.channel`; `metadata.role` defaults to `user`.
    /// Remaining keys are kept as event metadata.
    async fn store(&self, content: &str, metadata: &Metadata) -> Result<String> {
        let channel = meta_str(metadata, "channel")
            .ok_or_else(|| LayerError::InvalidInput("metadata.channel is required".into()))?;
        let role = match meta_str(metadata, "role") {
            Some(r) => r.parse()?,
            None => Role::User,
        };
        let extra: Metadata = metadata
            .iter()
            .filter(|(k, _)| k.as_str() != "channel" && k.as_str() != "role")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut input = EventInput::new(channel, role, content);
        if !extra.is_empty() {
            input.metadata = Some(serde_json::Value::Object(extra));
        }
        Ok(self.append(input).await?.id.to_string())
    }

    /// Empty query: the newest events. Otherwise keyword search over recent content.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let events = if query.trim().is_empty() {
            self.recent(limit, None).await?
        } else {
            self.keyword(query.to_string(), limit).await?
        };
        Ok(events
            .into_iter()
            .enumerate()
            .map(|(i, e)| event_result(e, i))
            .collect())
    }
}

#[async_trait]
impl RecentEvents for RawCaptureLayer {
    async fn recent_texts(&self, k: usize) -> Result<Vec<String>> {
        let events = self.recent(k, None).await?;
        Ok(events.into_iter().map(|e| e.content).collect())
    }
}
