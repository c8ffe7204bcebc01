//! The storage tiers behind ambient recall.
//!
//! Every tier implements [`Layer`]: `store` appends content and returns an id,
//! `search` returns ranked [`SearchResult`]s. The set of tiers is closed
//! ([`LayerKind`]) and wired explicitly by [`crate::engine::Engine`].

pub mod anchor;
pub mod crystal;
pub mod graph;
pub mod raw;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::error::{LayerError, Result};

/// Free-form key/value metadata attached to stored content and results.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Raw,
    Anchor,
    Graph,
    Crystal,
}

impl LayerKind {
    pub const ALL: [LayerKind; 4] = [Self::Anchor, Self::Graph, Self::Crystal, Self::Raw];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Anchor => "anchor",
            Self::Graph => "graph",
            Self::Crystal => "crystal",
        }
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LayerKind {
    type Err = LayerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Self::Raw),
            "anchor" => Ok(Self::Anchor),
            "graph" => Ok(Self::Graph),
            "crystal" => Ok(Self::Crystal),
            _ => Err(LayerError::InvalidInput(format!("unknown layer: {s}"))),
        }
    }
}

/// The common currency every layer returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub content: String,
    /// Opaque id usable for later reference or deletion in the originating layer.
    pub source_id: String,
    pub layer: LayerKind,
    /// Relevance in `[0, 1]`, placed inside the layer's fixed band.
    pub score: f64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: Metadata,
}

impl SearchResult {
    pub fn new(layer: LayerKind, source_id: impl Into<String>, content: impl Into<String>, score: f64) -> Self {
        Self {
            content: content.into(),
            source_id: source_id.into(),
            layer,
            score: score.clamp(0.0, 1.0),
            metadata: Metadata::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Contract shared by every storage tier.
///
/// Implementations must be safe to share between tasks and must report an
/// unreachable backing store as [`LayerError::Unavailable`], never as an empty
/// result.
#[async_trait]
pub trait Layer: Send + Sync {
    fn kind(&self) -> LayerKind;

    /// Persist `content` and return the id assigned by the layer.
    async fn store(&self, content: &str, metadata: &Metadata) -> Result<String>;

    /// Return up to `limit` results, best first, with non-increasing scores.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>>;
}

/// Fixed score bands. Cross-layer comparability is deliberately coarse: each
/// layer places its own ranking inside its band and nothing is renormalised.
pub mod bands {
    /// Entity summaries from node search.
    pub const NODE: f64 = 0.95;
    /// Explore edges, highest for the first seed's first edge.
    pub const EXPLORE_HIGH: f64 = 0.90;
    pub const EXPLORE_LOW: f64 = 0.80;
    /// Edge search, native score mapped linearly into this range.
    pub const EDGE_HIGH: f64 = 0.75;
    pub const EDGE_LOW: f64 = 0.10;
    pub const ANCHOR_HIGH: f64 = 0.90;
    pub const ANCHOR_LOW: f64 = 0.50;
    /// Newest current crystal; older ones step down.
    pub const CRYSTAL: f64 = 0.60;
    pub const CRYSTAL_STEP: f64 = 0.02;
    /// Newest raw event; older ones step down.
    pub const RAW: f64 = 0.30;
    pub const RAW_STEP: f64 = 0.01;

    /// Map `fraction` in `[0, 1]` linearly onto `[low, high]`.
    pub fn within(low: f64, high: f64, fraction: f64) -> f64 {
        low + (high - low) * fraction.clamp(0.0, 1.0)
    }

    /// Recency-stepped score for position `index`, never below zero.
    pub fn stepped(top: f64, step: f64, index: usize) -> f64 {
        (top - step * index as f64).max(0.0)
    }
}

/// Bound a backing-store call by `timeout`, mapping expiry to `Unavailable`.
pub async fn with_deadline<T, F>(layer: LayerKind, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(LayerError::unavailable(
            layer,
            format!("no response within {}ms", timeout.as_millis()),
        )),
    }
}

/// Read an optional string key from metadata.
pub(crate) fn meta_str<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(|v| v.as_str())
}

/// Truncate content to max_chars, appending "..." if truncated.
pub(crate) fn truncate_preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let cut: String = content.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_kind_round_trips_through_str() {
        for kind in LayerKind::ALL {
            assert_eq!(kind.as_str().parse::<LayerKind>().unwrap(), kind);
        }
        assert!("vector".parse::<LayerKind>().is_err());
    }

    #[test]
    fn bands_are_ordered() {
        assert!(bands::NODE > bands::EXPLORE_HIGH);
        assert!(bands::EXPLORE_LOW > bands::EDGE_HIGH);
        assert_eq!(bands::within(0.1, 0.75, 1.0), 0.75);
        assert_eq!(bands::within(0.1, 0.75, 2.0), 0.75);
        assert_eq!(bands::stepped(0.3, 0.01, 100), 0.0);
    }

    #[test]
    fn scores_are_clamped() {
        let r = SearchResult::new(LayerKind::Raw, "1", "x", 1.7);
        assert_eq!(r.score, 1.0);
    }

    #[tokio::test]
    async fn with_deadline_maps_timeout_to_unavailable() {
        let result: Result<()> = with_deadline(LayerKind::Graph, Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(result.unwrap_err().is_unavailable());
    }

    #[test]
    fn truncate_preview_respects_char_boundaries() {
        assert_eq!(truncate_preview("short", 80), "short");
        assert_eq!(truncate_preview("héllo wörld", 5), "héllo...");
    }
}
