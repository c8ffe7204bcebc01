//! Contract between the graph layer and whatever graph engine backs it.

use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Relation names that mark a near-duplicate pair. Compared case-insensitively
/// with `-` and `_` treated alike.
pub const DUPLICATE_RELATION: &str = "duplicate_of";

/// Lowercase, trimmed, `-` folded to `_`.
pub fn normalize_relation(relation: &str) -> String {
    relation.trim().to_ascii_lowercase().replace('-', "_")
}

/// Which edges an edge search may return. Engines apply it before cutting to
/// `limit`, so a filtered edge never takes a result slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeFilter {
    /// Relation names, normalized with [`normalize_relation`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_relations: Vec<String>,
    /// Leave out edges invalidated at or before this instant (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<String>,
}

impl EdgeFilter {
    /// No filtering, duplicate markers included.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn allows(&self, edge: &EdgeRecord) -> bool {
        let relation = normalize_relation(&edge.relation);
        if self.exclude_relations.iter().any(|r| *r == relation) {
            return false;
        }
        match &self.valid_at {
            Some(at) => !edge.is_invalidated(at),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityNode {
    pub id: String,
    pub name: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl EntityNode {
    /// Compact one-line description used as node-search content.
    pub fn describe(&self) -> String {
        match &self.summary {
            Some(s) if !s.is_empty() => format!("{} ({}): {}", self.name, self.label, s),
            _ => format!("{} ({})", self.name, self.label),
        }
    }
}

/// A time-stamped relationship between two entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub id: String,
    pub source: String,
    pub target: String,
    pub relation: String,
    #[serde(default)]
    pub fact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<String>,
    /// Set once the fact stopped holding; the edge itself is kept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_labels: Vec<String>,
    /// Engine-native relevance in `[0, 1]`.
    #[serde(default)]
    pub score: f64,
}

impl EdgeRecord {
    pub fn is_duplicate_marker(&self) -> bool {
        normalize_relation(&self.relation) == DUPLICATE_RELATION
    }

    /// Whether the fact was invalidated at or before `now`. Both sides are
    /// parsed as RFC 3339, so offsets and precision may differ. An
    /// `invalid_at` that does not parse counts as still valid.
    pub fn is_invalidated(&self, now: &str) -> bool {
        let Some(invalid_at) = self.invalid_at.as_deref() else {
            return false;
        };
        match (
            DateTime::parse_from_rfc3339(invalid_at),
            DateTime::parse_from_rfc3339(now),
        ) {
            (Ok(invalid_at), Ok(now)) => invalid_at <= now,
            _ => false,
        }
    }

    /// Text shown to the agent: the fact if present, otherwise the triple.
    pub fn display(&self) -> String {
        if self.fact.trim().is_empty() {
            format!("{} {} {}", self.source, self.relation, self.target)
        } else {
            self.fact.clone()
        }
    }

    /// The endpoint that is not `name`.
    pub fn other_end(&self, name: &str) -> &str {
        if self.source.eq_ignore_ascii_case(name) {
            &self.target
        } else {
            &self.source
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeHit {
    pub entity: EntityNode,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default)]
    pub summary: Option<String>,
}

fn default_label() -> String {
    "Entity".into()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEdge {
    pub source: String,
    pub target: String,
    pub relation: String,
    #[serde(default)]
    pub fact: String,
    #[serde(default)]
    pub valid_at: Option<String>,
    #[serde(default)]
    pub invalid_at: Option<String>,
}

/// Entities and edges pulled out of one piece of text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub edges: Vec<ExtractedEdge>,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.edges.is_empty()
    }
}

/// The text an extraction came from. `source` is stable per raw event
/// (`event:<id>`), which is what makes re-ingesting the same event a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub source: String,
    #[serde(default)]
    pub channel: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpsertStats {
    pub episode_id: String,
    pub entities: usize,
    pub edges_created: usize,
    pub edges_existing: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphCounts {
    pub entities: u64,
    pub edges: u64,
    pub episodes: u64,
}

/// A graph engine reachable through search, traversal, and upsert calls.
#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Short name for logs (`sqlite`, `remote`).
    fn name(&self) -> &'static str;

    /// Hybrid keyword/similarity search over relationship facts, best first.
    /// Up to `limit` edges that pass `filter`.
    async fn search_edges(&self, query: &str, limit: usize, filter: &EdgeFilter) -> Result<Vec<EdgeRecord>>;

    /// Entities most relevant to `query`, best first.
    async fn search_nodes(&self, query: &str, limit: usize) -> Result<Vec<NodeHit>>;

    /// One traversal step: edges touching the entity called `entity`.
    async fn edges_of(&self, entity: &str, limit: usize) -> Result<Vec<EdgeRecord>>;

    /// Merge an extraction into the graph. Must be idempotent per episode source.
    async fn upsert(&self, episode: &Episode, extraction: &Extraction) -> Result<UpsertStats>;

    async fn delete_edge(&self, id: &str) -> Result<bool>;

    async fn counts(&self) -> Result<GraphCounts>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(relation: &str) -> EdgeRecord {
        EdgeRecord {
            id: "e1".into(),
            source: "Ada".into(),
            target: "Strata".into(),
            relation: relation.into(),
            fact: String::new(),
            valid_at: None,
            invalid_at: None,
            entity_labels: Vec::new(),
            score: 0.5,
        }
    }

    #[test]
    fn duplicate_marker_spellings() {
        assert!(edge("duplicate_of").is_duplicate_marker());
        assert!(edge("DUPLICATE_OF").is_duplicate_marker());
        assert!(edge("duplicate-of").is_duplicate_marker());
        assert!(!edge("works_on").is_duplicate_marker());
    }

    #[test]
    fn invalidation_is_time_relative() {
        let mut e = edge("works_on");
        assert!(!e.is_invalidated("2026-01-01T00:00:00.000Z"));
        e.invalid_at = Some("2025-06-01T00:00:00.000Z".into());
        assert!(e.is_invalidated("2026-01-01T00:00:00.000Z"));
        assert!(!e.is_invalidated("2025-01-01T00:00:00.000Z"));
    }

    #[test]
    fn invalidation_compares_instants_not_strings() {
        let mut e = edge("works_on");
        // Same instant written three ways.
        e.invalid_at = Some("2025-06-01T02:00:00+02:00".into());
        assert!(e.is_invalidated("2025-06-01T00:00:00Z"));
        assert!(!e.is_invalidated("2025-05-31T23:59:59.999Z"));
        e.invalid_at = Some("2025-06-01T00:00:00Z".into());
        assert!(e.is_invalidated("2025-06-01T00:00:00.000Z"));
        e.invalid_at = Some("someday".into());
        assert!(!e.is_invalidated("2030-01-01T00:00:00.000Z"));
    }

    #[test]
    fn filter_drops_excluded_relations_and_stale_facts() {
        let filter = EdgeFilter {
            exclude_relations: vec![DUPLICATE_RELATION.into()],
            valid_at: Some("2026-01-01T00:00:00.000Z".into()),
        };
        assert!(!filter.allows(&edge("Duplicate-Of")));
        assert!(filter.allows(&edge("works_on")));
        let mut stale = edge("works_on");
        stale.invalid_at = Some("2025-12-31T23:00:00-02:00".into());
        assert!(filter.allows(&stale));
        stale.invalid_at = Some("2025-12-31T23:00:00+00:00".into());
        assert!(!filter.allows(&stale));
        assert!(EdgeFilter::all().allows(&edge("duplicate_of")));
    }

    #[test]
    fn display_falls_back_to_triple() {
        let mut e = edge("works_on");
        assert_eq!(e.display(), "Ada works_on Strata");
        e.fact = "Ada maintains Strata".into();
        assert_eq!(e.display(), "Ada maintains Strata");
        assert_eq!(e.other_end("ada"), "Strata");
    }
}
