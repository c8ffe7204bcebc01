#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use strata::config::{GraphBackendKind, StrataConfig};
use strata::db::Db;
use strata::engine::Engine;
use strata::layers::raw::{append_event, EventInput, Role};
use strata::layers::Metadata;

/// Defaults with a unique holder, a short deadline, and the model-free embedder.
pub fn test_config() -> StrataConfig {
    let mut config = StrataConfig::default();
    config.embedding.provider = "hashed".into();
    config.lock.holder = "test-holder".into();
    config.recall.deadline_ms = 1500;
    config
}

/// Graph pointed at a port nothing listens on, with no fallback.
pub fn graph_down_config() -> StrataConfig {
    let mut config = test_config();
    config.graph.backend = GraphBackendKind::Remote;
    config.graph.fallback = GraphBackendKind::None;
    config.graph.remote_url = "http://127.0.0.1:9".into();
    config.graph.timeout_ms = 300;
    config
}

pub fn test_engine() -> Arc<Engine> {
    Arc::new(Engine::in_memory(test_config()).unwrap())
}

/// Append `n` events, alternating between the given channels. Returns the last id.
pub fn seed_events(db: &Db, n: usize, channels: &[&str]) -> i64 {
    db.blocking(|conn| {
        let mut last = 0;
        for i in 0..n {
            let channel = channels[i % channels.len()];
            let event = append_event(
                conn,
                &EventInput::new(channel, Role::User, &format!("message {} from {channel}", i + 1)),
            )?;
            last = event.id;
        }
        Ok(last)
    })
    .unwrap()
}

pub fn meta(pairs: &[(&str, serde_json::Value)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn claim_ttl() -> Duration {
    Duration::from_secs(300)
}
