//! Construction of every component from one [`StrataConfig`].
//!
//! Nothing in the crate reaches for ambient state: the engine opens the
//! database once and hands each layer, the backlog tracker, the lock manager
//! and the orchestrator their own clone of the [`Db`] handle.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::StrataConfig;
use crate::db::{self, Db};
use crate::embedding::{self, EmbeddingProvider};
use crate::ingest::{create_extractor, BacklogTracker, Drainer};
use crate::layers::anchor::AnchorLayer;
use crate::layers::crystal::CrystalLayer;
use crate::layers::graph::entities::{EntityExtractor, HeuristicEntityExtractor};
use crate::layers::graph::explore::{Explorer, RecentEvents};
use crate::layers::graph::{backend_for, GraphLayer};
use crate::layers::raw::RawCaptureLayer;
use crate::layers::{Layer, LayerKind};
use crate::lock::LockManager;
use crate::recall::RecallOrchestrator;

pub struct Engine {
    pub config: Arc<StrataConfig>,
    pub db: Db,
    pub raw: Arc<RawCaptureLayer>,
    pub anchor: Arc<AnchorLayer>,
    pub graph: Arc<GraphLayer>,
    pub crystal: Arc<CrystalLayer>,
    pub backlog: BacklogTracker,
    pub drainer: Arc<Drainer>,
    pub locks: LockManager,
    pub recall: RecallOrchestrator,
}

impl Engine {
    /// Open the configured database file and wire everything to it.
    pub fn open(config: StrataConfig) -> Result<Self> {
        let db_path = config.resolved_db_path();
        let db = Db::open(&db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        info!(db = %db_path.display(), "database ready");
        Self::build(db, config)
    }

    /// Everything on a private in-memory database. For tests and dry runs.
    pub fn in_memory(config: StrataConfig) -> Result<Self> {
        Self::build(Db::open_in_memory()?, config)
    }

    pub fn build(db: Db, config: StrataConfig) -> Result<Self> {
        let provider: Arc<dyn EmbeddingProvider> =
            Arc::from(embedding::create_provider(&config.embedding)?);
        check_embedding_model(&db, provider.as_ref())?;

        let holder = config.lock.holder.clone();
        let locks = LockManager::new(
            db.clone(),
            holder.clone(),
            Duration::from_secs(config.lock.default_ttl_secs),
        );

        let raw = Arc::new(RawCaptureLayer::new(db.clone(), config.raw.clone()));
        let anchor = Arc::new(AnchorLayer::new(db.clone(), provider, config.anchor.clone()));
        let crystal = Arc::new(CrystalLayer::new(db.clone(), locks.clone(), config.crystal.clone()));

        let entities: Arc<dyn EntityExtractor> =
            Arc::new(HeuristicEntityExtractor::new(&config.explore.known_entities));
        let extractor = create_extractor(&config.ingest, Arc::clone(&entities))?;

        let primary = backend_for(config.graph.backend, &db, &config.graph)?;
        let fallback = if config.graph.fallback == config.graph.backend {
            None
        } else {
            backend_for(config.graph.fallback, &db, &config.graph)?
        };
        if primary.is_none() && fallback.is_none() {
            warn!("no graph backend configured, graph layer will report unavailable");
        }
        let explorer = config.explore.enabled.then(|| {
            let source: Arc<dyn RecentEvents> = raw.clone();
            Arc::new(Explorer::new(source, Arc::clone(&entities), config.explore.clone()))
        });
        let graph = Arc::new(GraphLayer::new(
            primary,
            fallback,
            explorer,
            Arc::clone(&extractor),
            config.graph.clone(),
        ));

        let backlog = BacklogTracker::new(
            db.clone(),
            holder,
            Duration::from_secs(config.ingest.claim_ttl_secs),
        );
        let drainer = Arc::new(Drainer::new(
            backlog.clone(),
            Arc::clone(&graph),
            extractor,
            locks.clone(),
            config.ingest.clone(),
        ));

        let recall = RecallOrchestrator::new(
            anchor.clone(),
            graph.clone(),
            crystal.clone(),
            raw.clone(),
            backlog.clone(),
            config.recall.clone(),
        );
        info!(
            graph_backend = ?config.graph.backend,
            graph_fallback = ?config.graph.fallback,
            explore = config.explore.enabled,
            "engine ready"
        );

        Ok(Self {
            config: Arc::new(config),
            db,
            raw,
            anchor,
            graph,
            crystal,
            backlog,
            drainer,
            locks,
            recall,
        })
    }

    /// The layer registered under `kind`.
    pub fn layer(&self, kind: LayerKind) -> Arc<dyn Layer> {
        match kind {
            LayerKind::Raw => self.raw.clone(),
            LayerKind::Anchor => self.anchor.clone(),
            LayerKind::Graph => self.graph.clone(),
            LayerKind::Crystal => self.crystal.clone(),
        }
    }
}

/// Record the provider on an empty anchor table; warn when stored vectors
/// came from a different one.
fn check_embedding_model(db: &Db, provider: &dyn EmbeddingProvider) -> Result<()> {
    let configured = provider.model_id();
    db.blocking(|conn| {
        let stored = db::migrations::get_embedding_model(conn)?;
        if stored.as_deref() == Some(configured.as_str()) {
            return Ok(());
        }
        let anchors: i64 = conn.query_row("SELECT COUNT(*) FROM anchors", [], |r| r.get(0))?;
        if anchors == 0 {
            db::migrations::set_embedding_model(conn, &configured)?;
        } else {
            warn!(
                stored = stored.as_deref().unwrap_or("(none)"),
                configured = %configured,
                "embedding model changed, existing anchors were embedded with another provider"
            );
        }
        Ok(())
    })?;
    Ok(())
}
