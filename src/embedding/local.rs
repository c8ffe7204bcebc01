//! Local ONNX Runtime embedding provider.
//!
//! Runs a sentence-transformers export (all-MiniLM-L6-v2 by default) through
//! `ort`: tokenization, inference, attention-masked mean pooling, then L2
//! normalization. Inference is CPU-bound, so [`EmbeddingProvider::embed`] hops
//! onto the blocking pool.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ndarray::{Array1, ArrayView2, ArrayView3, Axis};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};
use crate::config::{expand_tilde, EmbeddingConfig};

/// all-MiniLM-L6-v2 was trained at 256 tokens.
const MAX_SEQ_LEN: usize = 256;

/// Where `strata model download` puts the model and tokenizer for `config`.
pub fn model_files(config: &EmbeddingConfig) -> (PathBuf, PathBuf) {
    let dir = expand_tilde(&config.cache_dir);
    (dir.join("model.onnx"), dir.join("tokenizer.json"))
}

struct OnnxModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
}

// Tokenizer is Send + Sync; the session is only touched behind the mutex.
unsafe impl Send for OnnxModel {}
unsafe impl Sync for OnnxModel {}

pub struct LocalEmbeddingProvider {
    model: Arc<OnnxModel>,
    name: String,
}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_path, tokenizer_path) = model_files(config);
        anyhow::ensure!(
            model_path.exists(),
            "ONNX model not found at {}. Run `strata model download` first.",
            model_path.display()
        );
        anyhow::ensure!(
            tokenizer_path.exists(),
            "Tokenizer not found at {}. Run `strata model download` first.",
            tokenizer_path.display()
        );

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("failed to load ONNX model")?;
        tracing::info!(model = %model_path.display(), "ONNX model loaded");

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        Ok(Self {
            model: Arc::new(OnnxModel {
                session: Mutex::new(session),
                tokenizer,
            }),
            name: config.model.clone(),
        })
    }
}

impl OnnxModel {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;
        let batch_size = encodings.len();
        let seq_len = encodings[0].get_ids().len();

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        for encoding in &encodings {
            input_ids.extend(encoding.get_ids().iter().map(|&id| id as i64));
            attention_mask.extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
        }
        let mask_weights: Vec<f32> = attention_mask.iter().map(|&m| m as f32).collect();

        let shape = vec![batch_size as i64, seq_len as i64];
        let input_ids = Tensor::from_array((shape.clone(), input_ids.into_boxed_slice()))?;
        let mask_tensor = Tensor::from_array((shape.clone(), attention_mask.into_boxed_slice()))?;
        let token_type_ids =
            Tensor::from_array((shape, vec![0i64; batch_size * seq_len].into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => input_ids,
            "attention_mask" => mask_tensor,
            "token_type_ids" => token_type_ids,
        })?;

        // Output naming differs between exports.
        let token_embeddings = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);
        let (dims, data) = token_embeddings
            .try_extract_tensor::<f32>()
            .context("failed to extract token embeddings")?;
        let dims: &[i64] = &dims;
        anyhow::ensure!(
            dims.len() == 3 && dims[2] == EMBEDDING_DIM as i64,
            "unexpected token embedding shape {dims:?}, expected [batch, seq, {EMBEDDING_DIM}]"
        );

        let hidden = ArrayView3::from_shape((batch_size, dims[1] as usize, EMBEDDING_DIM), data)
            .context("token embeddings do not match their reported shape")?;
        let mask = ArrayView2::from_shape((batch_size, seq_len), mask_weights.as_slice())
            .context("attention mask does not match the batch")?;

        Ok(hidden
            .axis_iter(Axis(0))
            .zip(mask.axis_iter(Axis(0)))
            .map(|(tokens, weights)| mean_pool(tokens, weights))
            .collect())
    }
}

/// Attention-masked mean over token vectors, then unit length.
fn mean_pool(tokens: ArrayView2<'_, f32>, weights: ndarray::ArrayView1<'_, f32>) -> Vec<f32> {
    let mut pooled = Array1::<f32>::zeros(tokens.ncols());
    let mut count = 0.0f32;
    for (s, token) in tokens.axis_iter(Axis(0)).enumerate() {
        let w = weights.get(s).copied().unwrap_or(0.0);
        if w > 0.0 {
            pooled.scaled_add(w, &token);
            count += w;
        }
    }
    if count > 0.0 {
        pooled /= count;
    }
    let mut v = pooled.to_vec();
    l2_normalize(&mut v);
    v
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let text = text.to_string();
        let mut batch = tokio::task::spawn_blocking(move || model.embed_batch(&[text.as_str()]))
            .await
            .context("embedding task failed")??;
        batch.pop().context("embedding batch came back empty")
    }

    fn model_id(&self) -> String {
        format!("local:{}", self.name)
    }
}
