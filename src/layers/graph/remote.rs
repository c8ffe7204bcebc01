//! Graph backend served over HTTP+JSON by an external graph engine.
//!
//! Endpoints, relative to the base URL:
//! `POST /search/edges`, `POST /search/nodes`, `GET /entities/{name}/edges`,
//! `POST /episodes`, `DELETE /edges/{id}`, `GET /counts`.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

use super::backend::{
    EdgeFilter, EdgeRecord, Episode, Extraction, GraphBackend, GraphCounts, NodeHit, UpsertStats,
};
use crate::error::{LayerError, Result};
use crate::layers::LayerKind;

pub struct RemoteGraph {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteGraph {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LayerError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `base/segments...?limit=n`, with each segment percent-encoded.
    fn segment_url(&self, segments: &[&str], limit: Option<usize>) -> Result<Url> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| LayerError::InvalidInput(format!("bad graph url {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| LayerError::InvalidInput(format!("graph url cannot be a base: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        if let Some(limit) = limit {
            url.query_pairs_mut().append_pair("limit", &limit.to_string());
        }
        Ok(url)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp).await
    }
}

/// Connection failures and timeouts mean the engine is down, not that the
/// request was wrong.
fn transport_error(e: reqwest::Error) -> LayerError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        LayerError::unavailable(LayerKind::Graph, e.to_string())
    } else {
        LayerError::Http(e)
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if status.is_server_error() {
        return Err(LayerError::unavailable(
            LayerKind::Graph,
            format!("graph engine returned {status}"),
        ));
    }
    if status == StatusCode::BAD_REQUEST {
        let text = resp.text().await.unwrap_or_default();
        return Err(LayerError::InvalidInput(text));
    }
    if !status.is_success() {
        return Err(LayerError::Internal(format!("graph engine returned {status}")));
    }
    resp.json::<T>().await.map_err(LayerError::Http)
}

fn edge_search_body(query: &str, limit: usize, filter: &EdgeFilter) -> serde_json::Value {
    json!({
        "query": query,
        "limit": limit,
        "exclude_relations": filter.exclude_relations,
        "valid_at": filter.valid_at,
    })
}

#[async_trait]
impl GraphBackend for RemoteGraph {
    fn name(&self) -> &'static str {
        "remote"
    }

    /// The filter travels with the request (`exclude_relations`, `valid_at`)
    /// and is applied again locally for engines that ignore it.
    async fn search_edges(&self, query: &str, limit: usize, filter: &EdgeFilter) -> Result<Vec<EdgeRecord>> {
        let edges: Vec<EdgeRecord> = self
            .post("/search/edges", &edge_search_body(query, limit, filter))
            .await?;
        Ok(edges.into_iter().filter(|e| filter.allows(e)).collect())
    }

    async fn search_nodes(&self, query: &str, limit: usize) -> Result<Vec<NodeHit>> {
        self.post("/search/nodes", &json!({ "query": query, "limit": limit }))
            .await
    }

    async fn edges_of(&self, entity: &str, limit: usize) -> Result<Vec<EdgeRecord>> {
        let url = self.segment_url(&["entities", entity, "edges"], Some(limit))?;
        let resp = self.client.get(url).send().await.map_err(transport_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        decode(resp).await
    }

    async fn upsert(&self, episode: &Episode, extraction: &Extraction) -> Result<UpsertStats> {
        self.post(
            "/episodes",
            &json!({ "episode": episode, "extraction": extraction }),
        )
        .await
    }

    async fn delete_edge(&self, id: &str) -> Result<bool> {
        let resp = self
            .client
            .delete(self.segment_url(&["edges", id], None)?)
            .send()
            .await
            .map_err(transport_error)?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body: serde_json::Value = decode(resp).await?;
        Ok(body.get("deleted").and_then(|v| v.as_bool()).unwrap_or(true))
    }

    async fn counts(&self) -> Result<GraphCounts> {
        let resp = self
            .client
            .get(self.url("/counts"))
            .send()
            .await
            .map_err(transport_error)?;
        decode(resp).await
    }
}
