//! Proactive graph exploration seeded from what was said recently.
//!
//! Recent raw events are scanned for entity candidates, the top few become
//! seeds, and each seed gets a bounded breadth-first walk. Total traversal calls
//! per search never exceed `max_seeds * fanout_cap`.

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::backend::{EdgeRecord, GraphBackend};
use super::entities::EntityExtractor;
use crate::config::ExploreConfig;
use crate::error::Result;

/// Source of recent conversation text, newest first.
#[async_trait]
pub trait RecentEvents: Send + Sync {
    async fn recent_texts(&self, k: usize) -> Result<Vec<String>>;
}

/// Short-lived cache in front of [`RecentEvents`] so back-to-back searches do
/// not re-read the raw log.
pub struct RecentCache {
    source: Arc<dyn RecentEvents>,
    k: usize,
    ttl: Duration,
    state: Mutex<Option<(Instant, Vec<String>)>>,
}

impl RecentCache {
    pub fn new(source: Arc<dyn RecentEvents>, k: usize, ttl: Duration) -> Self {
        Self {
            source,
            k,
            ttl,
            state: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock().await;
        if let Some((at, texts)) = state.as_ref() {
            if at.elapsed() < self.ttl {
                return Ok(texts.clone());
            }
        }
        let texts = self.source.recent_texts(self.k).await?;
        *state = Some((Instant::now(), texts.clone()));
        Ok(texts)
    }

    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExploredEdge {
    pub seed: String,
    /// Hops from the seed, starting at 1.
    pub depth: usize,
    pub edge: EdgeRecord,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExploreOutcome {
    pub seeds: Vec<String>,
    pub edges: Vec<ExploredEdge>,
    /// Traversal calls issued against the backend.
    pub calls: usize,
}

pub struct Explorer {
    recent: RecentCache,
    extractor: Arc<dyn EntityExtractor>,
    config: ExploreConfig,
}

impl Explorer {
    pub fn new(
        source: Arc<dyn RecentEvents>,
        extractor: Arc<dyn EntityExtractor>,
        config: ExploreConfig,
    ) -> Self {
        let recent = RecentCache::new(source, config.recent_events, config.cache_ttl());
        Self {
            recent,
            extractor,
            config,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    /// Seed entities from recent events. Any failure yields no seeds.
    pub async fn seeds(&self) -> Vec<String> {
        if !self.config.enabled || self.config.max_seeds == 0 {
            return Vec::new();
        }
        let texts = match tokio::time::timeout(self.timeout(), self.recent.get()).await {
            Ok(Ok(texts)) => texts,
            Ok(Err(e)) => {
                warn!(error = %e, "explore skipped: recent events unavailable");
                return Vec::new();
            }
            Err(_) => {
                warn!(timeout_ms = self.config.timeout_ms, "explore skipped: recent events timed out");
                return Vec::new();
            }
        };
        self.extractor
            .candidates(&texts, self.config.max_candidates)
            .into_iter()
            .take(self.config.max_seeds)
            .map(|c| c.name)
            .collect()
    }

    /// Walk outward from every seed concurrently. Edges are deduplicated by id,
    /// keeping the first seed that reached them.
    pub async fn traverse(&self, backend: &dyn GraphBackend, seeds: &[String]) -> ExploreOutcome {
        let calls = AtomicUsize::new(0);
        let walks = seeds.iter().take(self.config.max_seeds).map(|seed| {
            let calls = &calls;
            async move {
                match tokio::time::timeout(self.timeout(), self.walk(backend, seed, calls)).await {
                    Ok(edges) => edges,
                    Err(_) => {
                        debug!(seed = %seed, "explore walk timed out");
                        Vec::new()
                    }
                }
            }
        });
        let per_seed = join_all(walks).await;

        let mut seen = HashSet::new();
        let edges = per_seed
            .into_iter()
            .flatten()
            .filter(|e| seen.insert(e.edge.id.clone()))
            .collect();
        ExploreOutcome {
            seeds: seeds.iter().take(self.config.max_seeds).cloned().collect(),
            edges,
            calls: calls.load(Ordering::Relaxed),
        }
    }

    pub async fn explore(&self, backend: &dyn GraphBackend) -> ExploreOutcome {
        let seeds = self.seeds().await;
        if seeds.is_empty() {
            return ExploreOutcome::default();
        }
        self.traverse(backend, &seeds).await
    }

    /// Breadth-first walk from one seed, at most `fanout_cap` calls.
    async fn walk(&self, backend: &dyn GraphBackend, seed: &str, calls: &AtomicUsize) -> Vec<ExploredEdge> {
        let cap = self.config.fanout_cap;
        let mut budget = cap;
        let mut out = Vec::new();
        let mut visited: HashSet<String> = HashSet::from([seed.to_lowercase()]);
        let mut frontier = vec![seed.to_string()];

        for depth in 1..=self.config.depth.max(1) {
            let mut next = Vec::new();
            for entity in &frontier {
                if budget == 0 {
                    return out;
                }
                budget -= 1;
                calls.fetch_add(1, Ordering::Relaxed);
                match backend.edges_of(entity, cap).await {
                    Ok(edges) => {
                        for edge in edges {
                            let other = edge.other_end(entity).to_string();
                            if visited.insert(other.to_lowercase()) {
                                next.push(other);
                            }
                            out.push(ExploredEdge {
                                seed: seed.to_string(),
                                depth,
                                edge,
                            });
                        }
                    }
                    Err(e) => debug!(entity = %entity, error = %e, "explore traversal failed"),
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        out
    }
}
