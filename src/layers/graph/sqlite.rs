//! Direct graph backend stored in the shared SQLite file.
//!
//! Entities are keyed by a normalized name. Edges are unique on
//! (source, relation, target, fact) so upserting the same extraction twice is
//! a no-op, the same way relation triples are deduplicated elsewhere.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::HashMap;

use super::backend::{
    normalize_relation, EdgeFilter, EdgeRecord, EntityNode, Episode, Extraction, GraphBackend,
    GraphCounts, NodeHit, UpsertStats,
};
use crate::db::{self, Db};
use crate::error::{LayerError, Result};
use crate::layers::raw::escape_fts_query;

/// Lowercased, whitespace-collapsed entity name.
pub fn name_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// BM25 rank (negative, lower is better) → `[0, 1)`, monotonic.
fn bm25_to_unit(rank: f64) -> f64 {
    let r = (-rank).max(0.0);
    r / (1.0 + r)
}

const EDGE_COLUMNS: &str =
    "ge.id, s.name, t.name, ge.relation, ge.fact, ge.valid_at, ge.invalid_at, s.label, t.label";
const EDGE_FROM: &str = "FROM graph_edges ge \
     JOIN graph_entities s ON s.id = ge.source_id \
     JOIN graph_entities t ON t.id = ge.target_id";

fn edge_from_row(row: &rusqlite::Row<'_>, score: f64) -> rusqlite::Result<EdgeRecord> {
    let source_label: String = row.get(7)?;
    let target_label: String = row.get(8)?;
    let mut labels = vec![source_label];
    if !labels.contains(&target_label) {
        labels.push(target_label);
    }
    Ok(EdgeRecord {
        id: row.get(0)?,
        source: row.get(1)?,
        target: row.get(2)?,
        relation: row.get(3)?,
        fact: row.get(4)?,
        valid_at: row.get(5)?,
        invalid_at: row.get(6)?,
        entity_labels: labels,
        score,
    })
}

// ── Synchronous operations ───────────────────────────────────────────────────

/// FTS hits over edge facts that pass `filter`, best first. Filtering happens
/// before the `LIMIT`. Invalidation goes through `julianday` so stored
/// timestamps with offsets or without milliseconds compare as instants.
pub fn search_edges(conn: &Connection, query: &str, limit: usize, filter: &EdgeFilter) -> Result<Vec<EdgeRecord>> {
    let escaped = escape_fts_query(query);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }
    let excluded: Vec<String> = filter
        .exclude_relations
        .iter()
        .map(|r| normalize_relation(r))
        .collect();
    let excluded = serde_json::to_string(&excluded)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {EDGE_COLUMNS}, hits.hit_rank {EDGE_FROM} \
         JOIN (SELECT id AS hit_id, rank AS hit_rank FROM graph_edges_fts \
         WHERE graph_edges_fts MATCH ?1) hits ON hits.hit_id = ge.id \
         WHERE replace(lower(trim(ge.relation)), '-', '_') NOT IN (SELECT value FROM json_each(?3)) \
         AND (?4 IS NULL OR ge.invalid_at IS NULL OR julianday(ge.invalid_at) IS NULL \
              OR julianday(ge.invalid_at) > julianday(?4)) \
         ORDER BY hits.hit_rank LIMIT ?2"
    ))?;
    let edges = stmt
        .query_map(params![escaped, limit as i64, excluded, filter.valid_at], |row| {
            let rank: f64 = row.get(9)?;
            edge_from_row(row, bm25_to_unit(rank))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(edges)
}

/// Entities whose name or summary mention query terms, scored by the share of
/// terms matched with name hits counting double.
pub fn search_nodes(conn: &Connection, query: &str, limit: usize) -> Result<Vec<NodeHit>> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '#')
        .filter(|t| t.chars().count() >= 3)
        .map(|t| t.to_lowercase())
        .collect();
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let clauses: Vec<String> = (1..=terms.len())
        .map(|i| format!("name_key LIKE ?{i} OR lower(COALESCE(summary, '')) LIKE ?{i}"))
        .collect();
    let sql = format!(
        "SELECT id, name, label, summary FROM graph_entities WHERE {} LIMIT 200",
        clauses.join(" OR ")
    );
    let patterns: Vec<String> = terms.iter().map(|t| format!("%{t}%")).collect();
    let params: Vec<&dyn rusqlite::types::ToSql> =
        patterns.iter().map(|p| p as &dyn rusqlite::types::ToSql).collect();

    let mut stmt = conn.prepare(&sql)?;
    let entities = stmt
        .query_map(params.as_slice(), |row| {
            Ok(EntityNode {
                id: row.get(0)?,
                name: row.get(1)?,
                label: row.get(2)?,
                summary: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut hits: Vec<NodeHit> = entities
        .into_iter()
        .map(|entity| {
            let name = entity.name.to_lowercase();
            let summary = entity.summary.clone().unwrap_or_default().to_lowercase();
            let weight: f64 = terms
                .iter()
                .map(|t| {
                    if name.contains(t.as_str()) {
                        2.0
                    } else if summary.contains(t.as_str()) {
                        1.0
                    } else {
                        0.0
                    }
                })
                .sum();
            let score = weight / (2.0 * terms.len() as f64);
            NodeHit { entity, score }
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entity.name.cmp(&b.entity.name))
    });
    hits.truncate(limit);
    Ok(hits)
}

/// Newest edges touching `entity`, in either direction.
pub fn edges_of(conn: &Connection, entity: &str, limit: usize) -> Result<Vec<EdgeRecord>> {
    let Some(entity_id) = conn
        .query_row(
            "SELECT id FROM graph_entities WHERE name_key = ?1",
            params![name_key(entity)],
            |row| row.get::<_, String>(0),
        )
        .optional()?
    else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT {EDGE_COLUMNS} {EDGE_FROM} WHERE ge.source_id = ?1 OR ge.target_id = ?1 \
         ORDER BY ge.created_at DESC, ge.id DESC LIMIT ?2"
    ))?;
    let edges = stmt
        .query_map(params![entity_id, limit as i64], |row| edge_from_row(row, 1.0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(edges)
}

fn upsert_entity(
    tx: &Transaction,
    cache: &mut HashMap<String, String>,
    name: &str,
    label: &str,
    summary: Option<&str>,
    now: &str,
) -> Result<String> {
    let key = name_key(name);
    if key.is_empty() {
        return Err(LayerError::InvalidInput("entity name must not be empty".into()));
    }
    tx.execute(
        "INSERT INTO graph_entities (id, name, name_key, label, summary, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(name_key) DO UPDATE SET \
           summary = COALESCE(excluded.summary, graph_entities.summary), \
           label = CASE WHEN graph_entities.label = 'Entity' THEN excluded.label ELSE graph_entities.label END",
        params![uuid::Uuid::now_v7().to_string(), name.trim(), key, label, summary, now],
    )?;
    if let Some(id) = cache.get(&key) {
        return Ok(id.clone());
    }
    let id: String = tx.query_row(
        "SELECT id FROM graph_entities WHERE name_key = ?1",
        params![key],
        |row| row.get(0),
    )?;
    cache.insert(key, id.clone());
    Ok(id)
}

pub fn upsert(conn: &mut Connection, episode: &Episode, extraction: &Extraction) -> Result<UpsertStats> {
    let tx = conn.transaction()?;
    let now = db::now_rfc3339();

    tx.execute(
        "INSERT OR IGNORE INTO graph_episodes (id, source, channel, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![uuid::Uuid::now_v7().to_string(), episode.source, episode.channel, now],
    )?;
    let episode_id: String = tx.query_row(
        "SELECT id FROM graph_episodes WHERE source = ?1",
        params![episode.source],
        |row| row.get(0),
    )?;

    let mut ids: HashMap<String, String> = HashMap::new();
    let mut stats = UpsertStats {
        episode_id: episode_id.clone(),
        ..Default::default()
    };

    for entity in &extraction.entities {
        upsert_entity(&tx, &mut ids, &entity.name, &entity.label, entity.summary.as_deref(), &now)?;
        stats.entities += 1;
    }

    for edge in &extraction.edges {
        let source_id = upsert_entity(&tx, &mut ids, &edge.source, "Entity", None, &now)?;
        let target_id = upsert_entity(&tx, &mut ids, &edge.target, "Entity", None, &now)?;
        let edge_id = uuid::Uuid::now_v7().to_string();
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO graph_edges \
             (id, source_id, target_id, relation, fact, valid_at, invalid_at, episode_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                edge_id,
                source_id,
                target_id,
                edge.relation,
                edge.fact,
                edge.valid_at,
                edge.invalid_at,
                episode_id,
                now
            ],
        )?;
        if inserted > 0 {
            tx.execute(
                "INSERT INTO graph_edges_fts (fact, relation, id) VALUES (?1, ?2, ?3)",
                params![edge.fact, edge.relation.replace('_', " "), edge_id],
            )?;
            stats.edges_created += 1;
        } else {
            stats.edges_existing += 1;
        }
    }

    tx.commit()?;
    Ok(stats)
}

pub fn delete_edge(conn: &mut Connection, id: &str) -> Result<bool> {
    let tx = conn.transaction()?;
    let rows = tx.execute("DELETE FROM graph_edges WHERE id = ?1", params![id])?;
    tx.execute("DELETE FROM graph_edges_fts WHERE id = ?1", params![id])?;
    tx.commit()?;
    Ok(rows > 0)
}

pub fn counts(conn: &Connection) -> Result<GraphCounts> {
    let count = |table: &str| -> Result<u64> {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        Ok(n as u64)
    };
    Ok(GraphCounts {
        entities: count("graph_entities")?,
        edges: count("graph_edges")?,
        episodes: count("graph_episodes")?,
    })
}

// ── Backend ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SqliteGraph {
    db: Db,
}

impl SqliteGraph {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl GraphBackend for SqliteGraph {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn search_edges(&self, query: &str, limit: usize, filter: &EdgeFilter) -> Result<Vec<EdgeRecord>> {
        let query = query.to_string();
        let filter = filter.clone();
        self.db
            .call(move |conn| search_edges(conn, &query, limit, &filter))
            .await
    }

    async fn search_nodes(&self, query: &str, limit: usize) -> Result<Vec<NodeHit>> {
        let query = query.to_string();
        self.db.call(move |conn| search_nodes(conn, &query, limit)).await
    }

    async fn edges_of(&self, entity: &str, limit: usize) -> Result<Vec<EdgeRecord>> {
        let entity = entity.to_string();
        self.db.call(move |conn| edges_of(conn, &entity, limit)).await
    }

    async fn upsert(&self, episode: &Episode, extraction: &Extraction) -> Result<UpsertStats> {
        let episode = episode.clone();
        let extraction = extraction.clone();
        self.db
            .call(move |conn| upsert(conn, &episode, &extraction))
            .await
    }

    async fn delete_edge(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.db.call(move |conn| delete_edge(conn, &id)).await
    }

    async fn counts(&self) -> Result<GraphCounts> {
        self.db.call(|conn| counts(conn)).await
    }
}
