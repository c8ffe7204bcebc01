//! Text → entities and edges, run once per raw event during a drain.
//!
//! Extraction must be safe to retry: the graph upsert is idempotent per
//! episode source, so re-running an extractor over the same event never
//! duplicates anything.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::IngestConfig;
use crate::error::{LayerError, Result};
use crate::layers::graph::backend::{ExtractedEdge, ExtractedEntity, Extraction};
use crate::layers::graph::entities::EntityExtractor;
use crate::layers::{truncate_preview, LayerKind};

/// Text any working extractor handles quickly.
const HEALTH_TEXT: &str = "Ada met Grace.";

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Extraction>;

    /// Whether the extractor is up at all. A drain asks this after one event
    /// fails as `Unavailable`, to tell an outage from a single bad input.
    async fn health_check(&self) -> Result<()> {
        self.extract(HEALTH_TEXT).await.map(|_| ())
    }
}

/// Build the configured extractor (`heuristic` or `remote`).
pub fn create_extractor(config: &IngestConfig, entities: Arc<dyn EntityExtractor>) -> Result<Arc<dyn Extractor>> {
    match config.extractor.as_str() {
        "heuristic" => Ok(Arc::new(HeuristicExtractor::new(entities))),
        "remote" => Ok(Arc::new(RemoteExtractor::new(&config.extractor_url)?)),
        other => Err(LayerError::InvalidInput(format!("unknown extractor: {other}"))),
    }
}

const MAX_ENTITIES: usize = 6;
const CO_MENTION: &str = "mentioned_with";
const MAX_FACT_CHARS: usize = 240;

/// No-model extractor: candidate entities from [`EntityExtractor`] and a
/// `mentioned_with` edge for every pair that appears in the same text.
pub struct HeuristicExtractor {
    entities: Arc<dyn EntityExtractor>,
}

impl HeuristicExtractor {
    pub fn new(entities: Arc<dyn EntityExtractor>) -> Self {
        Self { entities }
    }
}

/// The first sentence mentioning both names, else the whole text.
fn co_mention_fact(text: &str, a: &str, b: &str) -> String {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    let sentence = text
        .split(['.', '!', '?', '\n'])
        .map(str::trim)
        .find(|s| {
            let lower = s.to_lowercase();
            lower.contains(&a) && lower.contains(&b)
        })
        .unwrap_or(text.trim());
    truncate_preview(sentence, MAX_FACT_CHARS)
}

#[async_trait]
impl Extractor for HeuristicExtractor {
    async fn extract(&self, text: &str) -> Result<Extraction> {
        let candidates = self.entities.candidates(&[text.to_string()], MAX_ENTITIES);
        let entities: Vec<ExtractedEntity> = candidates
            .iter()
            .map(|c| ExtractedEntity {
                name: c.name.clone(),
                label: c.kind.label().to_string(),
                summary: None,
            })
            .collect();

        let mut edges = Vec::new();
        for (i, a) in candidates.iter().enumerate() {
            for b in &candidates[i + 1..] {
                edges.push(ExtractedEdge {
                    source: a.name.clone(),
                    target: b.name.clone(),
                    relation: CO_MENTION.to_string(),
                    fact: co_mention_fact(text, &a.name, &b.name),
                    valid_at: None,
                    invalid_at: None,
                });
            }
        }
        Ok(Extraction { entities, edges })
    }
}

/// Delegates to an HTTP extraction service: `POST {"text": ...}` → [`Extraction`].
pub struct RemoteExtractor {
    client: reqwest::Client,
    url: String,
}

impl RemoteExtractor {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LayerError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Extractor for RemoteExtractor {
    async fn extract(&self, text: &str) -> Result<Extraction> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    LayerError::unavailable(LayerKind::Graph, format!("extractor unreachable: {e}"))
                } else {
                    LayerError::Extraction(e.to_string())
                }
            })?;
        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LayerError::unavailable(
                LayerKind::Graph,
                format!("extractor returned {status}"),
            ));
        }
        if !status.is_success() {
            return Err(LayerError::Extraction(format!("extractor returned {status}")));
        }
        resp.json::<Extraction>()
            .await
            .map_err(|e| LayerError::Extraction(format!("bad extractor response: {e}")))
    }
}
