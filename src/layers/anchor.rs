//! Semantic anchors: small, curated, high-value texts loaded on every recall.
//!
//! The write path runs inside one transaction: a near-duplicate gate over the
//! vector index, then the row, FTS, and vector inserts. Search is hybrid: vector
//! KNN and FTS5 BM25 merged with Reciprocal Rank Fusion, then placed in the
//! anchor score band.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{bands, meta_str, truncate_preview, with_deadline, Layer, LayerKind, Metadata, SearchResult};
use crate::config::AnchorConfig;
use crate::db::{self, Db};
use crate::embedding::{cosine_threshold_to_l2, embedding_to_bytes, EmbeddingProvider};
use crate::error::{LayerError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_channel: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnchorInput {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub source_channel: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StoreAnchorResult {
    pub id: String,
    /// `true` if an existing near-duplicate absorbed this write.
    pub deduplicated: bool,
}

// ── Write path ───────────────────────────────────────────────────────────────

/// Dedup check → insert row → FTS sync → vector insert, in one transaction.
pub fn store_anchor(
    conn: &mut Connection,
    input: &AnchorInput,
    embedding: &[f32],
    dedup_threshold: f64,
) -> Result<StoreAnchorResult> {
    if input.content.trim().is_empty() {
        return Err(LayerError::InvalidInput("anchor content must not be empty".into()));
    }
    let tx = conn.transaction()?;
    let now = db::now_rfc3339();

    if let Some(existing_id) = check_dedup(&tx, embedding, dedup_threshold)? {
        tx.execute(
            "UPDATE anchors SET updated_at = ?1 WHERE id = ?2",
            params![now, existing_id],
        )?;
        tx.commit()?;
        return Ok(StoreAnchorResult {
            id: existing_id,
            deduplicated: true,
        });
    }

    let id = uuid::Uuid::now_v7().to_string();
    tx.execute(
        "INSERT INTO anchors (id, title, content, source_channel, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![id, input.title, input.content, input.source_channel, now],
    )?;
    tx.execute(
        "INSERT INTO anchors_fts (title, content, id) VALUES (?1, ?2, ?3)",
        params![input.title, input.content, id],
    )?;
    tx.execute(
        "INSERT INTO anchors_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(embedding)],
    )?;
    tx.commit()?;

    Ok(StoreAnchorResult {
        id,
        deduplicated: false,
    })
}

/// Nearest existing anchor within the cosine threshold, if any.
fn check_dedup(tx: &Transaction, embedding: &[f32], threshold: f64) -> Result<Option<String>> {
    if embedding.iter().all(|x| *x == 0.0) {
        return Ok(None);
    }
    let max_distance = cosine_threshold_to_l2(threshold);
    let nearest: Option<(String, f64)> = tx
        .query_row(
            "SELECT id, distance FROM anchors_vec WHERE embedding MATCH ?1 ORDER BY distance LIMIT 1",
            params![embedding_to_bytes(embedding)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(nearest.and_then(|(id, d)| (d <= max_distance).then_some(id)))
}

pub fn delete_anchor(conn: &mut Connection, id: &str) -> Result<bool> {
    let tx = conn.transaction()?;
    let rows = tx.execute("DELETE FROM anchors WHERE id = ?1", params![id])?;
    tx.execute("DELETE FROM anchors_fts WHERE id = ?1", params![id])?;
    tx.execute("DELETE FROM anchors_vec WHERE id = ?1", params![id])?;
    tx.commit()?;
    Ok(rows > 0)
}

// ── Read path ────────────────────────────────────────────────────────────────

/// Newest anchors first; the "always load" view.
pub fn list_anchors(conn: &Connection, limit: usize) -> Result<Vec<Anchor>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, content, source_channel, created_at, updated_at \
         FROM anchors ORDER BY updated_at DESC, id DESC LIMIT ?1",
    )?;
    let anchors = stmt
        .query_map(params![limit as i64], anchor_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(anchors)
}

/// Hybrid search: vector KNN + FTS5 BM25 → RRF merge → hydrate.
///
/// Scores are the raw RRF sums, best first.
pub fn search_anchors(
    conn: &Connection,
    embedding: &[f32],
    query_text: &str,
    limit: usize,
    rrf_k: usize,
) -> Result<Vec<(Anchor, f64)>> {
    let candidate_limit = (limit * 3).max(10);
    let vec_results = vector_search(conn, embedding, candidate_limit)?;
    let fts_results = fts_search(conn, query_text, candidate_limit)?;
    let merged = rrf_merge(&vec_results, &fts_results, rrf_k);

    let ids: Vec<&str> = merged.iter().map(|(id, _)| id.as_str()).collect();
    let mut anchors = fetch_anchors(conn, &ids)?;

    Ok(merged
        .into_iter()
        .filter_map(|(id, score)| anchors.remove(&id).map(|a| (a, score)))
        .take(limit)
        .collect())
}

fn anchor_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Anchor> {
    Ok(Anchor {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        source_channel: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn vector_search(conn: &Connection, embedding: &[f32], limit: usize) -> Result<Vec<(String, f64)>> {
    if embedding.iter().all(|x| *x == 0.0) {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT id, distance FROM anchors_vec \
         WHERE embedding MATCH ?1 ORDER BY distance LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![embedding_to_bytes(embedding), limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(results)
}

fn fts_search(conn: &Connection, query_text: &str, limit: usize) -> Result<Vec<(String, f64)>> {
    let escaped = super::raw::escape_fts_query(query_text);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT id, rank FROM anchors_fts WHERE anchors_fts MATCH ?1 ORDER BY rank LIMIT ?2",
    )?;
    let results = stmt
        .query_map(params![escaped, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(results)
}

/// Reciprocal Rank Fusion. Ids in both lists get additive scores.
fn rrf_merge(vec_results: &[(String, f64)], fts_results: &[(String, f64)], k: usize) -> Vec<(String, f64)> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    for list in [vec_results, fts_results] {
        for (rank, (id, _)) in list.iter().enumerate() {
            *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (k as f64 + rank as f64);
        }
    }
    let mut merged: Vec<(String, f64)> = scores.into_iter().collect();
    merged.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    merged
}

fn fetch_anchors(conn: &Connection, ids: &[&str]) -> Result<HashMap<String, Anchor>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT id, title, content, source_channel, created_at, updated_at \
         FROM anchors WHERE id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();
    let rows = stmt
        .query_map(params.as_slice(), anchor_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|a| (a.id.clone(), a)).collect())
}

/// Place an RRF sum into the anchor band. Rank 0 in both lists is the ceiling.
fn anchor_score(rrf: f64, k: usize) -> f64 {
    let ceiling = 2.0 / k.max(1) as f64;
    bands::within(bands::ANCHOR_LOW, bands::ANCHOR_HIGH, rrf / ceiling)
}

// ── Layer ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AnchorLayer {
    db: Db,
    embedder: Arc<dyn EmbeddingProvider>,
    config: AnchorConfig,
}

impl AnchorLayer {
    pub fn new(db: Db, embedder: Arc<dyn EmbeddingProvider>, config: AnchorConfig) -> Self {
        Self { db, embedder, config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        with_deadline(LayerKind::Anchor, self.timeout(), async {
            self.embedder
                .embed(text)
                .await
                .map_err(|e| LayerError::unavailable(LayerKind::Anchor, format!("embedding failed: {e}")))
        })
        .await
    }

    pub async fn put(&self, input: AnchorInput) -> Result<StoreAnchorResult> {
        let embedding = self.embed(&format!("{}\n{}", input.title, input.content)).await?;
        let threshold = self.config.dedup_threshold;
        let result = self
            .db
            .call(move |conn| store_anchor(conn, &input, &embedding, threshold))
            .await?;
        tracing::info!(id = %result.id, deduplicated = result.deduplicated, "anchor stored");
        Ok(result)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<Anchor>> {
        with_deadline(
            LayerKind::Anchor,
            self.timeout(),
            self.db.call(move |conn| list_anchors(conn, limit)),
        )
        .await
    }

    pub async fn delete(&self, id: String) -> Result<bool> {
        self.db.call(move |conn| delete_anchor(conn, &id)).await
    }
}

fn anchor_result(anchor: Anchor, score: f64) -> SearchResult {
    let mut result = SearchResult::new(LayerKind::Anchor, anchor.id, anchor.content, score)
        .with_meta("title", anchor.title)
        .with_meta("updated_at", anchor.updated_at);
    if let Some(channel) = anchor.source_channel {
        result = result.with_meta("source_channel", channel);
    }
    result
}

#[async_trait]
impl Layer for AnchorLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Anchor
    }

    /// `metadata.title` defaults to a preview of the content;
    /// `metadata.channel` tags the source channel.
    async fn store(&self, content: &str, metadata: &Metadata) -> Result<String> {
        let title = meta_str(metadata, "title")
            .map(str::to_string)
            .unwrap_or_else(|| truncate_preview(content, 60));
        let input = AnchorInput {
            title,
            content: content.to_string(),
            source_channel: meta_str(metadata, "channel").map(str::to_string),
        };
        Ok(self.put(input).await?.id)
    }

    /// Anchors are not query-gated: an empty query lists the newest ones.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            let anchors = self.list(limit).await?;
            return Ok(anchors
                .into_iter()
                .enumerate()
                .map(|(i, a)| anchor_result(a, bands::stepped(bands::ANCHOR_HIGH, 0.01, i).max(bands::ANCHOR_LOW)))
                .collect());
        }

        let embedding = self.embed(query).await?;
        let query_text = query.to_string();
        let k = self.config.rrf_k;
        let hits = with_deadline(
            LayerKind::Anchor,
            self.timeout(),
            self.db
                .call(move |conn| search_anchors(conn, &embedding, &query_text, limit, k)),
        )
        .await?;

        let mut results: Vec<SearchResult> = hits
            .into_iter()
            .map(|(a, rrf)| anchor_result(a, anchor_score(rrf, k)))
            .collect();

        // Backfill so the anchor set stays loaded even when nothing matched.
        if results.len() < limit {
            for anchor in self.list(limit).await? {
                if results.len() >= limit {
                    break;
                }
                if results.iter().all(|r| r.source_id != anchor.id) {
                    results.push(anchor_result(anchor, bands::ANCHOR_LOW));
                }
            }
        }
        Ok(results)
    }
}
