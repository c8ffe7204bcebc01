//! Ambient recall: one call that asks every layer at once.
//!
//! Anchor, graph, crystal, and recent-raw searches run concurrently under one
//! shared deadline, next to a backlog count. A layer that errors or runs past
//! the deadline contributes nothing and is flagged in the bundle; it never
//! fails the call. Results keep their layer's score band and are merged with a
//! stable sort, so each layer's own order survives.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::RecallConfig;
use crate::error::{LayerError, Result};
use crate::ingest::BacklogTracker;
use crate::layers::{Layer, LayerKind, SearchResult};

#[derive(Debug, Clone, Deserialize)]
pub struct RecallRequest {
    pub context: String,
    #[serde(default)]
    pub limit_per_layer: Option<usize>,
    /// Restrict the fan-out to these layers. `None` asks all of them.
    #[serde(default)]
    pub layers: Option<Vec<LayerKind>>,
}

impl RecallRequest {
    pub fn new(context: impl Into<String>, limit_per_layer: usize) -> Self {
        Self {
            context: context.into(),
            limit_per_layer: Some(limit_per_layer),
            layers: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LayerHealth {
    pub available: bool,
    pub unavailable: bool,
    pub count: usize,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHealth {
    /// `None` when the count could not be read in time.
    pub backlog_pending: Option<u64>,
    pub backlog_available: bool,
    pub latency_ms: u64,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Bundle {
    pub results: Vec<SearchResult>,
    pub layers: BTreeMap<LayerKind, LayerHealth>,
    pub health: MemoryHealth,
}

impl Bundle {
    pub fn results_for(&self, kind: LayerKind) -> impl Iterator<Item = &SearchResult> {
        self.results.iter().filter(move |r| r.layer == kind)
    }
}

pub struct RecallOrchestrator {
    anchor: Arc<dyn Layer>,
    graph: Arc<dyn Layer>,
    crystal: Arc<dyn Layer>,
    raw: Arc<dyn Layer>,
    backlog: BacklogTracker,
    config: RecallConfig,
}

type LayerOutcome = (LayerKind, Option<(Result<Vec<SearchResult>>, Duration)>);

impl RecallOrchestrator {
    pub fn new(
        anchor: Arc<dyn Layer>,
        graph: Arc<dyn Layer>,
        crystal: Arc<dyn Layer>,
        raw: Arc<dyn Layer>,
        backlog: BacklogTracker,
        config: RecallConfig,
    ) -> Self {
        Self {
            anchor,
            graph,
            crystal,
            raw,
            backlog,
            config,
        }
    }

    fn validate(&self, req: &RecallRequest) -> Result<usize> {
        let limit = req.limit_per_layer.unwrap_or(self.config.default_limit_per_layer);
        if limit == 0 || limit > self.config.max_limit_per_layer {
            return Err(LayerError::InvalidInput(format!(
                "limit_per_layer must be between 1 and {}",
                self.config.max_limit_per_layer
            )));
        }
        if req.context.chars().count() > self.config.max_context_chars {
            return Err(LayerError::InvalidInput(format!(
                "context longer than {} characters",
                self.config.max_context_chars
            )));
        }
        Ok(limit)
    }

    /// Run one layer's search under the shared deadline, or skip it.
    async fn run<F>(kind: LayerKind, wanted: bool, deadline: Duration, fut: F) -> LayerOutcome
    where
        F: Future<Output = Result<Vec<SearchResult>>>,
    {
        if !wanted {
            return (kind, None);
        }
        let started = Instant::now();
        let result = match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(LayerError::unavailable(
                kind,
                format!("recall deadline of {}ms exceeded", deadline.as_millis()),
            )),
        };
        (kind, Some((result, started.elapsed())))
    }

    pub async fn recall(&self, req: &RecallRequest) -> Result<Bundle> {
        let limit = self.validate(req)?;
        let started = Instant::now();
        let deadline = self.config.deadline();
        let context = req.context.as_str();
        let wanted = |kind: LayerKind| req.layers.as_ref().is_none_or(|ls| ls.contains(&kind));
        let raw_limit = self.config.recent_raw_limit.min(limit);

        let (anchor, graph, crystal, raw, backlog) = tokio::join!(
            Self::run(LayerKind::Anchor, wanted(LayerKind::Anchor), deadline, self.anchor.search(context, limit)),
            Self::run(LayerKind::Graph, wanted(LayerKind::Graph), deadline, self.graph.search(context, limit)),
            Self::run(LayerKind::Crystal, wanted(LayerKind::Crystal), deadline, self.crystal.search(context, limit)),
            // Recent raw rides along regardless of the context.
            Self::run(LayerKind::Raw, wanted(LayerKind::Raw) && raw_limit > 0, deadline, self.raw.search("", raw_limit)),
            tokio::time::timeout(deadline, self.backlog.count_pending()),
        );

        let mut results = Vec::new();
        let mut layers = BTreeMap::new();
        for (kind, outcome) in [anchor, graph, crystal, raw] {
            let Some((result, elapsed)) = outcome else {
                continue;
            };
            let latency_ms = elapsed.as_millis() as u64;
            let health = match result {
                Ok(found) => {
                    debug!(layer = %kind, count = found.len(), latency_ms, "layer answered");
                    let health = LayerHealth {
                        available: true,
                        count: found.len(),
                        latency_ms,
                        ..Default::default()
                    };
                    results.extend(found);
                    health
                }
                Err(e) => {
                    warn!(layer = %kind, error = %e, latency_ms, "layer degraded");
                    LayerHealth {
                        available: false,
                        unavailable: true,
                        count: 0,
                        latency_ms,
                        error: Some(e.to_string()),
                    }
                }
            };
            layers.insert(kind, health);
        }

        let backlog_pending = match backlog {
            Ok(Ok(n)) => Some(n),
            Ok(Err(e)) => {
                warn!(error = %e, "backlog count unavailable");
                None
            }
            Err(_) => {
                warn!("backlog count timed out");
                None
            }
        };

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(self.config.max_total_items);

        let degraded = layers.values().any(|h| h.unavailable) || backlog_pending.is_none();
        let latency_ms = started.elapsed().as_millis() as u64;
        info!(results = results.len(), degraded, latency_ms, "recall");

        Ok(Bundle {
            results,
            layers,
            health: MemoryHealth {
                backlog_pending,
                backlog_available: backlog_pending.is_some(),
                latency_ms,
                degraded,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::layers::{bands, Metadata};
    use async_trait::async_trait;

    /// Returns `n` results in its band, optionally after a delay or with an error.
    struct Fake {
        kind: LayerKind,
        n: usize,
        top: f64,
        delay: Duration,
        fail: bool,
    }

    impl Fake {
        fn new(kind: LayerKind, n: usize, top: f64) -> Arc<dyn Layer> {
            Arc::new(Self {
                kind,
                n,
                top,
                delay: Duration::ZERO,
                fail: false,
            })
        }
    }

    #[async_trait]
    impl Layer for Fake {
        fn kind(&self) -> LayerKind {
            self.kind
        }
        async fn store(&self, _c: &str, _m: &Metadata) -> Result<String> {
            Ok("1".into())
        }
        async fn search(&self, _q: &str, limit: usize) -> Result<Vec<SearchResult>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(LayerError::unavailable(self.kind, "down"));
            }
            Ok((0..self.n.min(limit))
                .map(|i| {
                    SearchResult::new(
                        self.kind,
                        format!("{}-{i}", self.kind),
                        format!("{} item {i}", self.kind),
                        bands::stepped(self.top, 0.01, i),
                    )
                })
                .collect())
        }
    }

    fn backlog() -> BacklogTracker {
        BacklogTracker::new(Db::open_in_memory().unwrap(), "test", Duration::from_secs(300))
    }

    fn orchestrator(graph: Arc<dyn Layer>, config: RecallConfig) -> RecallOrchestrator {
        RecallOrchestrator::new(
            Fake::new(LayerKind::Anchor, 3, bands::ANCHOR_HIGH),
            graph,
            Fake::new(LayerKind::Crystal, 2, bands::CRYSTAL),
            Fake::new(LayerKind::Raw, 10, bands::RAW),
            backlog(),
            config,
        )
    }

    #[tokio::test]
    async fn results_are_merged_by_band() {
        let o = orchestrator(Fake::new(LayerKind::Graph, 2, bands::NODE), RecallConfig::default());
        let bundle = o.recall(&RecallRequest::new("x", 10)).await.unwrap();
        let kinds: Vec<LayerKind> = bundle.results.iter().map(|r| r.layer).collect();
        assert_eq!(kinds[..2], [LayerKind::Graph, LayerKind::Graph]);
        assert_eq!(kinds.last(), Some(&LayerKind::Raw));
        assert!(bundle.results.windows(2).all(|w| w[0].score >= w[1].score));
        // Recent raw is capped separately from the per-layer limit.
        assert_eq!(bundle.results_for(LayerKind::Raw).count(), 5);
        assert!(!bundle.health.degraded);
        assert_eq!(bundle.health.backlog_pending, Some(0));
    }

    #[tokio::test]
    async fn slow_layer_is_flagged_not_waited_for() {
        let slow: Arc<dyn Layer> = Arc::new(Fake {
            kind: LayerKind::Graph,
            n: 2,
            top: bands::NODE,
            delay: Duration::from_secs(5),
            fail: false,
        });
        let config = RecallConfig {
            deadline_ms: 100,
            ..RecallConfig::default()
        };
        let o = orchestrator(slow, config);
        let started = Instant::now();
        let bundle = o.recall(&RecallRequest::new("x", 10)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        let graph = &bundle.layers[&LayerKind::Graph];
        assert!(graph.unavailable);
        assert_eq!(graph.count, 0);
        assert!(bundle.health.degraded);
        assert_eq!(bundle.results_for(LayerKind::Anchor).count(), 3);
    }

    #[tokio::test]
    async fn failing_layer_degrades() {
        let failing: Arc<dyn Layer> = Arc::new(Fake {
            kind: LayerKind::Graph,
            n: 0,
            top: bands::NODE,
            delay: Duration::ZERO,
            fail: true,
        });
        let o = orchestrator(failing, RecallConfig::default());
        let bundle = o.recall(&RecallRequest::new("x", 10)).await.unwrap();
        assert!(bundle.layers[&LayerKind::Graph].unavailable);
        assert!(bundle.layers[&LayerKind::Graph].error.is_some());
        assert!(bundle.layers[&LayerKind::Crystal].available);
    }

    #[tokio::test]
    async fn total_items_are_capped() {
        let config = RecallConfig {
            max_total_items: 4,
            ..RecallConfig::default()
        };
        let o = orchestrator(Fake::new(LayerKind::Graph, 10, bands::NODE), config);
        let bundle = o.recall(&RecallRequest::new("x", 10)).await.unwrap();
        assert_eq!(bundle.results.len(), 4);
        assert_eq!(bundle.layers[&LayerKind::Graph].count, 10);
    }

    #[tokio::test]
    async fn layer_selection_skips_the_rest() {
        let o = orchestrator(Fake::new(LayerKind::Graph, 2, bands::NODE), RecallConfig::default());
        let req = RecallRequest {
            context: "x".into(),
            limit_per_layer: Some(5),
            layers: Some(vec![LayerKind::Crystal]),
        };
        let bundle = o.recall(&req).await.unwrap();
        assert_eq!(bundle.layers.len(), 1);
        assert!(bundle.results.iter().all(|r| r.layer == LayerKind::Crystal));
    }

    #[tokio::test]
    async fn bad_limits_are_rejected() {
        let o = orchestrator(Fake::new(LayerKind::Graph, 2, bands::NODE), RecallConfig::default());
        for limit in [0, 51] {
            let err = o.recall(&RecallRequest::new("x", limit)).await.unwrap_err();
            assert!(matches!(err, LayerError::InvalidInput(_)));
        }
        let long = "x".repeat(RecallConfig::default().max_context_chars + 1);
        assert!(o.recall(&RecallRequest::new(long, 5)).await.is_err());
    }
}
