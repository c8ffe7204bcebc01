//! Moves claimed raw events into the knowledge graph.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backlog::BacklogTracker;
use super::extract::Extractor;
use crate::config::IngestConfig;
use crate::error::{LayerError, Result};
use crate::layers::graph::backend::Episode;
use crate::layers::graph::GraphLayer;
use crate::lock::{names, LockManager};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    /// `None` when there was nothing to drain.
    pub batch_id: Option<i64>,
    pub start_id: i64,
    pub end_id: i64,
    pub events: usize,
    pub ingested: usize,
    /// Events whose extraction or upsert failed and were left out of the graph.
    pub skipped: usize,
    pub edges_created: usize,
    pub channels: Vec<String>,
    pub reissued: bool,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.batch_id.is_none()
    }
}

pub struct Drainer {
    backlog: BacklogTracker,
    graph: Arc<GraphLayer>,
    extractor: Arc<dyn Extractor>,
    locks: LockManager,
    config: IngestConfig,
}

impl Drainer {
    pub fn new(
        backlog: BacklogTracker,
        graph: Arc<GraphLayer>,
        extractor: Arc<dyn Extractor>,
        locks: LockManager,
        config: IngestConfig,
    ) -> Self {
        Self {
            backlog,
            graph,
            extractor,
            locks,
            config,
        }
    }

    pub fn backlog(&self) -> &BacklogTracker {
        &self.backlog
    }

    /// Claim one batch, push every event through extraction and upsert, then
    /// mark the range done.
    ///
    /// A failing event is skipped. When an event fails as `Unavailable`, the
    /// dependency is checked: if it is down the claim goes back and the range is
    /// retried whole later, otherwise only that event is skipped.
    pub async fn drain(&self, batch_size: usize) -> Result<DrainReport> {
        let Some(claim) = self.backlog.take_batch(batch_size).await? else {
            return Ok(DrainReport::default());
        };
        let channels = claim.channels();
        let mut report = DrainReport {
            batch_id: None,
            start_id: claim.start_id,
            end_id: claim.end_id,
            events: claim.events.len(),
            channels: channels.clone(),
            reissued: claim.reissued,
            ..Default::default()
        };

        for event in &claim.events {
            let extraction = match self.extractor.extract(&event.content).await {
                Ok(x) => x,
                Err(e) if e.is_unavailable() => {
                    if self.extractor.health_check().await.is_err() {
                        return self.abandon(claim.id, e).await;
                    }
                    warn!(event = event.id, error = %e, "extractor is up but failed this event, skipping it");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(event = event.id, error = %e, "extraction failed, skipping event");
                    report.skipped += 1;
                    continue;
                }
            };
            if extraction.is_empty() {
                report.ingested += 1;
                continue;
            }
            let episode = Episode {
                source: format!("event:{}", event.id),
                channel: Some(event.channel.clone()),
                content: event.content.clone(),
            };
            match self.graph.upsert(&episode, &extraction).await {
                Ok(stats) => {
                    report.ingested += 1;
                    report.edges_created += stats.edges_created;
                }
                Err(e) if e.is_unavailable() => {
                    if self.graph.counts().await.is_err() {
                        return self.abandon(claim.id, e).await;
                    }
                    warn!(event = event.id, error = %e, "graph is up but failed this event, skipping it");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(event = event.id, error = %e, "graph upsert failed, skipping event");
                    report.skipped += 1;
                }
            }
        }

        let batch_id = self
            .backlog
            .mark_batched(claim.start_id, claim.end_id, channels)
            .await?;
        report.batch_id = Some(batch_id);
        info!(
            batch = batch_id,
            start_id = report.start_id,
            end_id = report.end_id,
            ingested = report.ingested,
            skipped = report.skipped,
            edges = report.edges_created,
            "backlog batch drained"
        );
        Ok(report)
    }

    async fn abandon(&self, claim_id: i64, cause: LayerError) -> Result<DrainReport> {
        warn!(claim = claim_id, error = %cause, "drain aborted, releasing claim");
        if let Err(e) = self.backlog.release(claim_id).await {
            warn!(claim = claim_id, error = %e, "failed to release claim, it will expire");
        }
        Err(cause)
    }

    /// Drain until the backlog is empty or `max_batches` batches are done.
    pub async fn drain_all(&self, batch_size: usize, max_batches: usize) -> Result<Vec<DrainReport>> {
        let mut reports = Vec::new();
        for _ in 0..max_batches {
            let report = self.drain(batch_size).await?;
            if report.is_empty() {
                break;
            }
            reports.push(report);
        }
        Ok(reports)
    }

    /// Drain one batch if the backlog has crossed the configured threshold.
    pub async fn drain_if_needed(&self) -> Result<Option<DrainReport>> {
        let pending = self.backlog.count_pending().await?;
        if pending < self.config.threshold {
            debug!(pending, threshold = self.config.threshold, "backlog below threshold");
            return Ok(None);
        }
        Ok(Some(self.drain(self.config.batch_size).await?))
    }

    /// One scheduled tick: take the drain lock, drain while over the threshold.
    pub async fn tick(&self) -> Result<usize> {
        let ttl = Duration::from_secs(self.config.claim_ttl_secs);
        if !self.locks.acquire(names::INGEST_DRAIN, Some(ttl)).await? {
            debug!("drain lock held by another process");
            return Ok(0);
        }
        let mut drained = 0;
        let result = loop {
            match self.drain_if_needed().await {
                Ok(Some(report)) if !report.is_empty() => {
                    drained += 1;
                    if !self.locks.renew(names::INGEST_DRAIN).await.unwrap_or(false) {
                        break Ok(drained);
                    }
                }
                Ok(_) => break Ok(drained),
                Err(e) => break Err(e),
            }
        };
        self.locks.release(names::INGEST_DRAIN).await?;
        result
    }

    /// Run [`Drainer::tick`] every `interval_secs` until `shutdown` flips to true.
    pub fn spawn_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "background drain started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            warn!(error = %e, "background drain failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("background drain stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GraphConfig;
    use crate::db::Db;
    use crate::ingest::extract::HeuristicExtractor;
    use crate::layers::graph::backend::{
        EdgeFilter, EdgeRecord, Extraction, GraphBackend, GraphCounts, NodeHit, UpsertStats,
    };
    use crate::layers::graph::entities::HeuristicEntityExtractor;
    use crate::layers::graph::sqlite::SqliteGraph;
    use crate::layers::raw::{append_event, EventInput, Role};
    use async_trait::async_trait;

    struct Failing {
        on: &'static str,
        unavailable: bool,
    }

    #[async_trait]
    impl Extractor for Failing {
        async fn extract(&self, text: &str) -> Result<Extraction> {
            if text.contains(self.on) {
                if self.unavailable {
                    return Err(LayerError::unavailable(
                        crate::layers::LayerKind::Graph,
                        "extractor down",
                    ));
                }
                return Err(LayerError::Extraction("unparseable".into()));
            }
            HeuristicExtractor::new(Arc::new(HeuristicEntityExtractor::new(&[])))
                .extract(text)
                .await
        }
    }

    /// Every call times out, health checks included.
    struct Down;

    #[async_trait]
    impl Extractor for Down {
        async fn extract(&self, _text: &str) -> Result<Extraction> {
            Err(LayerError::unavailable(
                crate::layers::LayerKind::Graph,
                "extractor unreachable: operation timed out",
            ))
        }
    }

    /// SQLite graph that times out upserting any episode mentioning `on`.
    struct Choking {
        inner: SqliteGraph,
        on: &'static str,
    }

    #[async_trait]
    impl GraphBackend for Choking {
        fn name(&self) -> &'static str {
            "choking"
        }
        async fn search_edges(&self, q: &str, l: usize, f: &EdgeFilter) -> Result<Vec<EdgeRecord>> {
            self.inner.search_edges(q, l, f).await
        }
        async fn search_nodes(&self, q: &str, l: usize) -> Result<Vec<NodeHit>> {
            self.inner.search_nodes(q, l).await
        }
        async fn edges_of(&self, e: &str, l: usize) -> Result<Vec<EdgeRecord>> {
            self.inner.edges_of(e, l).await
        }
        async fn upsert(&self, episode: &Episode, x: &Extraction) -> Result<UpsertStats> {
            if episode.content.contains(self.on) {
                return Err(LayerError::unavailable(
                    crate::layers::LayerKind::Graph,
                    "operation timed out",
                ));
            }
            self.inner.upsert(episode, x).await
        }
        async fn delete_edge(&self, id: &str) -> Result<bool> {
            self.inner.delete_edge(id).await
        }
        async fn counts(&self) -> Result<GraphCounts> {
            self.inner.counts().await
        }
    }

    fn heuristic() -> Arc<dyn Extractor> {
        Arc::new(HeuristicExtractor::new(Arc::new(HeuristicEntityExtractor::new(&[]))))
    }

    fn drainer(db: &Db, extractor: Arc<dyn Extractor>, threshold: u64) -> Drainer {
        drainer_on(db, Arc::new(SqliteGraph::new(db.clone())), extractor, threshold)
    }

    fn drainer_on(
        db: &Db,
        backend: Arc<dyn GraphBackend>,
        extractor: Arc<dyn Extractor>,
        threshold: u64,
    ) -> Drainer {
        let graph = Arc::new(GraphLayer::new(
            Some(backend),
            None,
            None,
            heuristic(),
            GraphConfig::default(),
        ));
        let config = IngestConfig {
            threshold,
            ..IngestConfig::default()
        };
        Drainer::new(
            BacklogTracker::new(db.clone(), "test", Duration::from_secs(300)),
            graph,
            extractor,
            LockManager::new(db.clone(), "test", Duration::from_secs(30)),
            config,
        )
    }

    fn seed(db: &Db, texts: &[&str]) {
        db.blocking(|conn| {
            for t in texts {
                append_event(conn, &EventInput::new("discord", Role::User, t))?;
            }
            Ok(())
        })
        .unwrap();
    }

    #[tokio::test]
    async fn drain_ingests_and_marks_the_batch() {
        let db = Db::open_in_memory().unwrap();
        seed(&db, &["Grace met Linus", "Ada reviewed the Scheduler", "no names here"]);
        let d = drainer(&db, heuristic(), 20);

        let report = d.drain(10).await.unwrap();
        assert_eq!((report.start_id, report.end_id), (1, 3));
        assert_eq!(report.ingested, 3);
        assert_eq!(report.skipped, 0);
        assert!(report.edges_created >= 2);
        assert_eq!(d.backlog().count_pending().await.unwrap(), 0);

        assert!(d.drain(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_item_is_skipped_not_fatal() {
        let db = Db::open_in_memory().unwrap();
        seed(&db, &["Grace met Linus", "poison Ada", "Ada met Barbara"]);
        let d = drainer(&db, Arc::new(Failing { on: "poison", unavailable: false }), 20);

        let report = d.drain(10).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.ingested, 2);
        assert!(report.batch_id.is_some());
    }

    #[tokio::test]
    async fn one_timing_out_event_does_not_stall_the_backlog() {
        let db = Db::open_in_memory().unwrap();
        seed(&db, &["Grace met Linus", "poison Ada", "Ada met Barbara"]);
        let d = drainer(&db, Arc::new(Failing { on: "poison", unavailable: true }), 20);

        let report = d.drain(10).await.unwrap();
        assert_eq!((report.start_id, report.end_id), (1, 3));
        assert_eq!(report.skipped, 1);
        assert_eq!(report.ingested, 2);
        assert_eq!(d.backlog().count_pending().await.unwrap(), 0);
        assert!(d.drain(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_upsert_timing_out_is_skipped_while_the_graph_is_up() {
        let db = Db::open_in_memory().unwrap();
        seed(&db, &["Grace met Linus", "poison Ada met Ken", "Ada met Barbara"]);
        let backend = Arc::new(Choking {
            inner: SqliteGraph::new(db.clone()),
            on: "poison",
        });
        let d = drainer_on(&db, backend, heuristic(), 20);

        let report = d.drain(10).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.ingested, 2);
        assert!(report.batch_id.is_some());
        assert_eq!(d.backlog().count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn outage_releases_the_claim() {
        let db = Db::open_in_memory().unwrap();
        seed(&db, &["Grace met Linus", "Ada met Barbara"]);
        let d = drainer(&db, Arc::new(Down), 20);
        assert!(d.drain(10).await.unwrap_err().is_unavailable());
        assert_eq!(d.backlog().count_pending().await.unwrap(), 2);

        // The released range comes back verbatim once the extractor recovers.
        let healthy = drainer(&db, heuristic(), 20);
        let report = healthy.drain(10).await.unwrap();
        assert!(report.reissued);
        assert_eq!((report.start_id, report.end_id), (1, 2));
    }

    #[tokio::test]
    async fn drain_if_needed_respects_threshold() {
        let db = Db::open_in_memory().unwrap();
        seed(&db, &["Grace met Linus", "Ada met Barbara"]);
        let d = drainer(&db, heuristic(), 3);
        assert!(d.drain_if_needed().await.unwrap().is_none());

        seed(&db, &["Ken met Dennis"]);
        let report = d.drain_if_needed().await.unwrap().unwrap();
        assert_eq!(report.events, 3);
    }

    #[tokio::test]
    async fn tick_skips_when_another_process_drains() {
        let db = Db::open_in_memory().unwrap();
        seed(&db, &["Grace met Linus"]);
        let d = drainer(&db, heuristic(), 1);
        let other = LockManager::new(db.clone(), "other", Duration::from_secs(30));
        assert!(other.acquire(names::INGEST_DRAIN, None).await.unwrap());

        assert_eq!(d.tick().await.unwrap(), 0);
        other.release(names::INGEST_DRAIN).await.unwrap();
        assert_eq!(d.tick().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn loop_stops_on_shutdown() {
        let db = Db::open_in_memory().unwrap();
        let d = Arc::new(drainer(&db, heuristic(), 20));
        let (tx, rx) = watch::channel(false);
        let handle = d.spawn_loop(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
