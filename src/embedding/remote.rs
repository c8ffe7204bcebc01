//! OpenAI-compatible `/embeddings` client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};

pub struct RemoteEmbeddingProvider {
    client: reqwest::Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl RemoteEmbeddingProvider {
    pub fn new(url: &str, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build embedding http client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.url)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await
            .with_context(|| format!("embedding request to {} failed", self.url))?;

        anyhow::ensure!(
            response.status().is_success(),
            "embedding endpoint returned HTTP {}",
            response.status()
        );

        let body: EmbeddingResponse = response.json().await.context("bad embedding response")?;
        let mut embedding = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .context("embedding response had no data")?;

        anyhow::ensure!(
            embedding.len() == EMBEDDING_DIM,
            "embedding model {} returned {} dimensions, expected {EMBEDDING_DIM}",
            self.model,
            embedding.len()
        );
        l2_normalize(&mut embedding);
        Ok(embedding)
    }

    fn model_id(&self) -> String {
        format!("remote:{}", self.model)
    }
}
