use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StrataConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub recall: RecallConfig,
    pub raw: RawConfig,
    pub anchor: AnchorConfig,
    pub embedding: EmbeddingConfig,
    pub graph: GraphConfig,
    pub explore: ExploreConfig,
    pub crystal: CrystalConfig,
    pub ingest: IngestConfig,
    pub lock: LockConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecallConfig {
    /// Shared deadline for the whole fan-out.
    pub deadline_ms: u64,
    pub default_limit_per_layer: usize,
    pub max_limit_per_layer: usize,
    /// Cap on the blended bundle, across all layers.
    pub max_total_items: usize,
    /// How many recent raw events ride along with every recall.
    pub recent_raw_limit: usize,
    pub max_context_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RawConfig {
    /// Keyword search only scans this many of the newest events.
    pub search_window: usize,
    /// Share of an `around` window that lands before the center.
    pub around_ratio: f64,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AnchorConfig {
    pub rrf_k: usize,
    pub dedup_threshold: f64,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `local` (ONNX), `remote`, or `hashed` (lexical only, no model files).
    pub provider: String,
    pub url: String,
    pub model: String,
    /// Where the local model and tokenizer live.
    pub cache_dir: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GraphBackendKind {
    Sqlite,
    Remote,
    None,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphConfig {
    /// Primary (direct) path.
    pub backend: GraphBackendKind,
    /// Secondary path used when the primary fails.
    pub fallback: GraphBackendKind,
    pub remote_url: String,
    pub edge_limit: usize,
    pub node_limit: usize,
    pub timeout_ms: u64,
    pub include_invalidated: bool,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExploreConfig {
    pub enabled: bool,
    /// Number of recent raw events scanned for seed entities.
    pub recent_events: usize,
    pub max_candidates: usize,
    pub max_seeds: usize,
    pub fanout_cap: usize,
    pub depth: usize,
    pub cache_ttl_secs: u64,
    pub timeout_ms: u64,
    /// Proper nouns that are always recognised and outrank generic capitalised words.
    pub known_entities: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CrystalConfig {
    /// Number of crystals considered current.
    pub window: usize,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub batch_size: usize,
    /// Drain once this many events are pending.
    pub threshold: u64,
    pub interval_secs: u64,
    pub claim_ttl_secs: u64,
    pub auto_drain: bool,
    /// `heuristic` or `remote`.
    pub extractor: String,
    pub extractor_url: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LockConfig {
    /// Identity this process uses when claiming locks and batches.
    pub holder: String,
    pub default_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 7431,
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_strata_dir()
            .join("strata.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            deadline_ms: 2000,
            default_limit_per_layer: 10,
            max_limit_per_layer: 50,
            max_total_items: 40,
            recent_raw_limit: 5,
            max_context_chars: 8000,
        }
    }
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            search_window: 500,
            around_ratio: 0.5,
            timeout_ms: 1000,
        }
    }
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60,
            dedup_threshold: 0.95,
            timeout_ms: 1000,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".into(),
            url: "http://127.0.0.1:11434/v1/embeddings".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir: "~/.strata/models".into(),
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            backend: GraphBackendKind::Sqlite,
            fallback: GraphBackendKind::None,
            remote_url: "http://127.0.0.1:8000".into(),
            edge_limit: 10,
            node_limit: 5,
            timeout_ms: 1500,
            include_invalidated: false,
        }
    }
}

impl Default for ExploreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            recent_events: 10,
            max_candidates: 5,
            max_seeds: 3,
            fanout_cap: 5,
            depth: 1,
            cache_ttl_secs: 30,
            timeout_ms: 500,
            known_entities: Vec::new(),
        }
    }
}

impl Default for CrystalConfig {
    fn default() -> Self {
        Self {
            window: 7,
            timeout_ms: 1000,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            threshold: 20,
            interval_secs: 60,
            claim_ttl_secs: 300,
            auto_drain: false,
            extractor: "heuristic".into(),
            extractor_url: "http://127.0.0.1:8001/extract".into(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            holder: default_holder(),
            default_ttl_secs: 30,
        }
    }
}

/// `pid-<pid>-<uuid suffix>`, unique per process.
pub fn default_holder() -> String {
    let id = uuid::Uuid::now_v7().simple().to_string();
    format!("pid-{}-{}", std::process::id(), &id[id.len() - 8..])
}

/// Returns `~/.strata/`
pub fn default_strata_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".strata")
}

/// Returns the default config file path: `~/.strata/config.toml`
pub fn default_config_path() -> PathBuf {
    default_strata_dir().join("config.toml")
}

impl StrataConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            StrataConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (STRATA_DB, STRATA_LOG_LEVEL, STRATA_BIND, STRATA_GRAPH_URL, STRATA_HOLDER,
    /// STRATA_EMBEDDING_PROVIDER).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("STRATA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("STRATA_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("STRATA_BIND") {
            match val.rsplit_once(':') {
                Some((host, port)) => {
                    if let Ok(port) = port.parse() {
                        self.server.host = host.to_string();
                        self.server.port = port;
                    }
                }
                None => self.server.host = val,
            }
        }
        if let Ok(val) = std::env::var("STRATA_GRAPH_URL") {
            self.graph.remote_url = val;
        }
        if let Ok(val) = std::env::var("STRATA_HOLDER") {
            self.lock.holder = val;
        }
        if let Ok(val) = std::env::var("STRATA_EMBEDDING_PROVIDER") {
            self.embedding.provider = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl RecallConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

impl ExploreConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Upper bound on traversal calls a single search may issue.
    pub fn traversal_budget(&self) -> usize {
        self.max_seeds * self.fanout_cap
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = StrataConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.recall.deadline_ms, 2000);
        assert_eq!(config.ingest.batch_size, 20);
        assert_eq!(config.ingest.threshold, 20);
        assert_eq!(config.explore.max_candidates, 5);
        assert_eq!(config.explore.max_seeds, 3);
        assert_eq!(config.explore.depth, 1);
        assert_eq!(config.explore.cache_ttl_secs, 30);
        assert_eq!(config.graph.backend, GraphBackendKind::Sqlite);
        assert_eq!(config.embedding.provider, "local");
        assert!(config.embedding.cache_dir.ends_with("models"));
        assert!(config.storage.db_path.ends_with("strata.db"));
        assert!(config.lock.holder.starts_with("pid-"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"

[graph]
backend = "remote"
fallback = "sqlite"
remote_url = "http://graph:9000"

[explore]
known_entities = ["Strata", "Ada"]

[crystal]
window = 3
"#;
        let config: StrataConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.graph.backend, GraphBackendKind::Remote);
        assert_eq!(config.graph.fallback, GraphBackendKind::Sqlite);
        assert_eq!(config.graph.remote_url, "http://graph:9000");
        assert_eq!(config.explore.known_entities, vec!["Strata", "Ada"]);
        assert_eq!(config.crystal.window, 3);
        // defaults still apply for unset fields
        assert_eq!(config.graph.edge_limit, 10);
        assert_eq!(config.recall.max_total_items, 40);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = StrataConfig::default();
        std::env::set_var("STRATA_DB", "/tmp/override.db");
        std::env::set_var("STRATA_LOG_LEVEL", "trace");
        std::env::set_var("STRATA_BIND", "0.0.0.0:9999");
        std::env::set_var("STRATA_HOLDER", "worker-7");
        std::env::set_var("STRATA_EMBEDDING_PROVIDER", "hashed");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.bind_addr(), "0.0.0.0:9999");
        assert_eq!(config.lock.holder, "worker-7");
        assert_eq!(config.embedding.provider, "hashed");

        std::env::remove_var("STRATA_DB");
        std::env::remove_var("STRATA_LOG_LEVEL");
        std::env::remove_var("STRATA_BIND");
        std::env::remove_var("STRATA_HOLDER");
        std::env::remove_var("STRATA_EMBEDDING_PROVIDER");
    }

    #[test]
    fn traversal_budget_is_seeds_times_fanout() {
        let config = ExploreConfig::default();
        assert_eq!(config.traversal_budget(), 15);
    }
}
