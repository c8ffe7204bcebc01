//! Knowledge graph layer: entities, time-stamped relationship edges, and
//! proactive exploration around whatever was mentioned recently.
//!
//! A primary backend serves every call; a configured fallback takes over when
//! the primary errors or misses its deadline. Both share one time budget per
//! operation. Near-duplicate markers and invalidated facts are filtered by the
//! backend before it applies its limit, so they never crowd out real edges.

pub mod backend;
pub mod entities;
pub mod explore;
pub mod remote;
pub mod sqlite;

use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use self::backend::{
    EdgeFilter, EdgeRecord, Episode, Extraction, GraphBackend, GraphCounts, NodeHit, UpsertStats,
    DUPLICATE_RELATION,
};
use self::explore::{ExploreOutcome, Explorer};
use self::remote::RemoteGraph;
use self::sqlite::SqliteGraph;
use super::{bands, meta_str, with_deadline, Layer, LayerKind, Metadata, SearchResult};
use crate::config::{GraphBackendKind, GraphConfig};
use crate::db::{self, Db};
use crate::error::{LayerError, Result};
use crate::ingest::extract::Extractor;

/// Build the backend for one configured path. `None` means the path is off.
pub fn backend_for(kind: GraphBackendKind, db: &Db, config: &GraphConfig) -> Result<Option<Arc<dyn GraphBackend>>> {
    let backend: Arc<dyn GraphBackend> = match kind {
        GraphBackendKind::Sqlite => Arc::new(SqliteGraph::new(db.clone())),
        GraphBackendKind::Remote => Arc::new(RemoteGraph::new(
            &config.remote_url,
            Duration::from_millis(config.timeout_ms),
        )?),
        GraphBackendKind::None => return Ok(None),
    };
    Ok(Some(backend))
}

/// Time left for one graph operation, shared by every backend call it makes.
#[derive(Debug, Clone, Copy)]
struct Budget {
    started: Instant,
    total: Duration,
}

impl Budget {
    fn new(total: Duration) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.started.elapsed())
    }
}

pub struct GraphLayer {
    primary: Option<Arc<dyn GraphBackend>>,
    fallback: Option<Arc<dyn GraphBackend>>,
    explorer: Option<Arc<Explorer>>,
    extractor: Arc<dyn Extractor>,
    config: GraphConfig,
}

impl GraphLayer {
    pub fn new(
        primary: Option<Arc<dyn GraphBackend>>,
        fallback: Option<Arc<dyn GraphBackend>>,
        explorer: Option<Arc<Explorer>>,
        extractor: Arc<dyn Extractor>,
        config: GraphConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            explorer,
            extractor,
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.primary.is_some() || self.fallback.is_some()
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Run `op` on the primary, then on the fallback if the primary failed,
    /// all within `budget`. The primary gets half of it when a fallback is
    /// configured. Returns the value together with the backend that produced it.
    async fn route<T, F, Fut>(&self, op: &'static str, budget: Budget, f: F) -> Result<(T, Arc<dyn GraphBackend>)>
    where
        F: Fn(Arc<dyn GraphBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backends: Vec<&Arc<dyn GraphBackend>> = self.primary.iter().chain(self.fallback.iter()).collect();
        let mut last_err: Option<LayerError> = None;
        for (i, backend) in backends.iter().enumerate() {
            let left = budget.remaining();
            if left.is_zero() {
                last_err = Some(LayerError::unavailable(LayerKind::Graph, format!("{op} ran out of time")));
                break;
            }
            let slice = if i + 1 < backends.len() { left / 2 } else { left };
            match with_deadline(LayerKind::Graph, slice, f(Arc::clone(backend))).await {
                Ok(value) => return Ok((value, Arc::clone(backend))),
                Err(e @ (LayerError::InvalidInput(_) | LayerError::NotFound(_))) => return Err(e),
                Err(e) => {
                    warn!(backend = backend.name(), op, error = %e, "graph backend failed");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) if e.is_unavailable() => e,
            Some(e) => LayerError::unavailable(LayerKind::Graph, e.to_string()),
            None => LayerError::unavailable(LayerKind::Graph, "no graph backend configured"),
        })
    }

    fn budget(&self) -> Budget {
        Budget::new(self.timeout())
    }

    /// Duplicate markers always; invalidated facts unless configured otherwise.
    pub fn edge_filter(&self) -> EdgeFilter {
        EdgeFilter {
            exclude_relations: vec![DUPLICATE_RELATION.to_string()],
            valid_at: (!self.config.include_invalidated).then(db::now_rfc3339),
        }
    }

    /// Edge hits under this layer's [`EdgeFilter`].
    pub async fn search_edges(&self, query: &str, limit: usize) -> Result<Vec<EdgeRecord>> {
        let filter = &self.edge_filter();
        let (edges, _) = self
            .route("search_edges", self.budget(), |b| async move {
                b.search_edges(query, limit, filter).await
            })
            .await?;
        Ok(edges)
    }

    pub async fn search_nodes(&self, query: &str, limit: usize) -> Result<Vec<NodeHit>> {
        let (nodes, _) = self
            .route("search_nodes", self.budget(), |b| async move { b.search_nodes(query, limit).await })
            .await?;
        Ok(nodes)
    }

    pub async fn upsert(&self, episode: &Episode, extraction: &Extraction) -> Result<UpsertStats> {
        let (stats, _) = self
            .route("upsert", self.budget(), |b| async move { b.upsert(episode, extraction).await })
            .await?;
        Ok(stats)
    }

    /// Remove one edge. `Ok(false)` when no backend knows the id.
    pub async fn delete_edge(&self, id: &str) -> Result<bool> {
        let (deleted, _) = self
            .route("delete_edge", self.budget(), |b| async move { b.delete_edge(id).await })
            .await?;
        Ok(deleted)
    }

    pub async fn counts(&self) -> Result<GraphCounts> {
        let (counts, _) = self
            .route("counts", self.budget(), |b| async move { b.counts().await })
            .await?;
        Ok(counts)
    }

    /// Explore around recent mentions using `backend`, or an empty outcome
    /// when exploration is off.
    pub async fn explore(&self, backend: &dyn GraphBackend, seeds: &[String]) -> ExploreOutcome {
        match &self.explorer {
            Some(explorer) if !seeds.is_empty() => explorer.traverse(backend, seeds).await,
            _ => ExploreOutcome::default(),
        }
    }

    async fn seeds(&self) -> Vec<String> {
        match &self.explorer {
            Some(explorer) => explorer.seeds().await,
            None => Vec::new(),
        }
    }
}

fn edge_result(edge: &EdgeRecord, kind: &str, score: f64) -> SearchResult {
    let mut result = SearchResult::new(LayerKind::Graph, &edge.id, edge.display(), score)
        .with_meta("kind", kind)
        .with_meta("predicate", edge.relation.as_str())
        .with_meta("source", edge.source.as_str())
        .with_meta("target", edge.target.as_str());
    if let Some(valid_at) = &edge.valid_at {
        result = result.with_meta("valid_at", valid_at.as_str());
    }
    if let Some(invalid_at) = &edge.invalid_at {
        result = result.with_meta("invalid_at", invalid_at.as_str());
    }
    if !edge.entity_labels.is_empty() {
        result = result.with_meta("entity_labels", edge.entity_labels.clone());
    }
    result
}

fn node_result(hit: &NodeHit) -> SearchResult {
    SearchResult::new(LayerKind::Graph, &hit.entity.id, hit.entity.describe(), bands::NODE)
        .with_meta("kind", "node")
        .with_meta("name", hit.entity.name.as_str())
        .with_meta("entity_labels", vec![hit.entity.label.clone()])
}

#[async_trait]
impl Layer for GraphLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Graph
    }

    /// Extract entities and edges from `content` and merge them as one episode.
    /// Returns the episode id.
    async fn store(&self, content: &str, metadata: &Metadata) -> Result<String> {
        if content.trim().is_empty() {
            return Err(LayerError::InvalidInput("content must not be empty".into()));
        }
        let episode = Episode {
            source: meta_str(metadata, "source")
                .map(str::to_string)
                .unwrap_or_else(|| format!("episode:{}", uuid::Uuid::now_v7())),
            channel: meta_str(metadata, "channel").map(str::to_string),
            content: content.to_string(),
        };
        let extraction = self.extractor.extract(content).await?;
        let stats = self.upsert(&episode, &extraction).await?;
        debug!(
            episode = %stats.episode_id,
            entities = stats.entities,
            edges = stats.edges_created,
            "graph episode stored"
        );
        Ok(stats.episode_id)
    }

    /// Nodes first, then explore edges, then edge-search hits, each inside its
    /// own score band.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let edge_limit = self.config.edge_limit.min(limit);
        let node_limit = self.config.node_limit.min(limit);
        let budget = self.budget();
        let filter = &self.edge_filter();

        let (edges, nodes, seeds) = tokio::join!(
            self.route("search_edges", budget, |b| async move {
                b.search_edges(query, edge_limit, filter).await
            }),
            self.route("search_nodes", budget, |b| async move {
                b.search_nodes(query, node_limit).await
            }),
            async {
                tokio::time::timeout(budget.remaining(), self.seeds())
                    .await
                    .unwrap_or_default()
            },
        );

        let (edges, nodes, backend) = match (edges, nodes) {
            (Ok((edges, backend)), Ok((nodes, _))) => (edges, nodes, backend),
            (Ok((edges, backend)), Err(e)) => {
                warn!(error = %e, "node search failed, continuing with edges");
                (edges, Vec::new(), backend)
            }
            (Err(e), Ok((nodes, backend))) => {
                warn!(error = %e, "edge search failed, continuing with nodes");
                (Vec::new(), nodes, backend)
            }
            (Err(e), Err(_)) => return Err(e),
        };

        let explored = match tokio::time::timeout(budget.remaining(), self.explore(backend.as_ref(), &seeds)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!("explore cut short by the search deadline");
                ExploreOutcome::default()
            }
        };

        let mut results: Vec<SearchResult> = nodes.iter().map(node_result).collect();

        let explore_edges: Vec<_> = explored
            .edges
            .iter()
            .filter(|e| filter.allows(&e.edge))
            .collect();
        let n = explore_edges.len().max(1) as f64;
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, explored_edge) in explore_edges.iter().enumerate() {
            seen.insert(explored_edge.edge.id.as_str());
            let score = bands::within(bands::EXPLORE_LOW, bands::EXPLORE_HIGH, 1.0 - i as f64 / n);
            results.push(
                edge_result(&explored_edge.edge, "explore", score)
                    .with_meta("seed", explored_edge.seed.as_str())
                    .with_meta("depth", explored_edge.depth),
            );
        }

        let mut ranked: Vec<&EdgeRecord> = edges
            .iter()
            .filter(|e| filter.allows(e) && !seen.contains(e.id.as_str()))
            .collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        for edge in ranked {
            let score = bands::within(bands::EDGE_LOW, bands::EDGE_HIGH, edge.score);
            results.push(edge_result(edge, "edge", score));
        }

        results.truncate(limit);
        Ok(results)
    }
}
