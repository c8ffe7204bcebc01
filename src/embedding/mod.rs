//! Text-to-vector embedding for the semantic anchor layer.
//!
//! Provides the [`EmbeddingProvider`] trait and three implementations:
//! - `local`: all-MiniLM-L6-v2 on ONNX Runtime (the default)
//! - `remote`: an OpenAI-compatible `/embeddings` endpoint
//! - `hashed`: lexical feature hashing with no model files, for offline use
//!   and tests
//!
//! All produce L2-normalized vectors of [`EMBEDDING_DIM`] dimensions.

pub mod hashed;
pub mod local;
pub mod remote;

use anyhow::Result;
use async_trait::async_trait;

/// Width of the `anchors_vec` column.
pub const EMBEDDING_DIM: usize = 384;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Identifier recorded in `schema_meta` so a provider switch can be detected.
    fn model_id(&self) -> String;
}

/// Create an embedding provider from config.
///
/// `local` fails when the model files are missing; run `strata model download`.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => Ok(Box::new(local::LocalEmbeddingProvider::new(config)?)),
        "hashed" => Ok(Box::new(hashed::HashedEmbeddingProvider::new())),
        "remote" => Ok(Box::new(remote::RemoteEmbeddingProvider::new(
            &config.url,
            &config.model,
        )?)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, remote, hashed"),
    }
}

/// The `model_id` a provider built from `config` would report, without
/// loading anything.
pub fn configured_model_id(config: &crate::config::EmbeddingConfig) -> String {
    match config.provider.as_str() {
        "local" => format!("local:{}", config.model),
        "remote" => format!("remote:{}", config.model),
        "hashed" => hashed::MODEL_ID.to_string(),
        other => other.to_string(),
    }
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            std::mem::size_of_val(embedding),
        )
    }
}

/// L2 distance between unit vectors whose cosine similarity is `cosine`.
pub fn cosine_threshold_to_l2(cosine: f64) -> f64 {
    (2.0 - 2.0 * cosine).max(0.0).sqrt()
}
