//! Feature-hashing embedding provider.
//!
//! Lowercased word unigrams and character trigrams are hashed into
//! [`EMBEDDING_DIM`] buckets with a sign bit, then L2-normalized. Texts sharing
//! vocabulary land close together; it knows nothing about synonyms. Needs no
//! model files and is deterministic across processes, which suits offline
//! setups and tests.

use anyhow::Result;
use async_trait::async_trait;

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};

pub const MODEL_ID: &str = "hashed-384";

#[derive(Debug, Default, Clone)]
pub struct HashedEmbeddingProvider;

impl HashedEmbeddingProvider {
    pub fn new() -> Self {
        Self
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        let lowered = text.to_lowercase();
        for word in lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            add_feature(&mut v, word.as_bytes(), 1.0);
            let padded: Vec<char> = format!("^{word}$").chars().collect();
            for tri in padded.windows(3) {
                let s: String = tri.iter().collect();
                add_feature(&mut v, s.as_bytes(), 0.5);
            }
        }
        l2_normalize(&mut v);
        v
    }
}

/// FNV-1a; stable across platforms and releases, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

fn add_feature(v: &mut [f32], feature: &[u8], weight: f32) {
    let h = fnv1a(feature);
    let bucket = (h % EMBEDDING_DIM as u64) as usize;
    let sign = if (h >> 63) & 1 == 1 { -1.0 } else { 1.0 };
    v[bucket] += sign * weight;
}

#[async_trait]
impl EmbeddingProvider for HashedEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn model_id(&self) -> String {
        MODEL_ID.into()
    }
}
