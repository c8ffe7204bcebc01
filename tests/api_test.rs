//! Integration tests for the HTTP API.
//!
//! Each test spins up a real server on a random port over an in-memory engine.

mod helpers;

use serde_json::{json, Value};
use std::sync::Arc;

use strata::config::StrataConfig;
use strata::engine::Engine;
use strata::server::{create_router, AppState};

use helpers::{graph_down_config, test_config};

/// Spin up a test server and return the base URL.
async fn start_test_server(config: StrataConfig) -> String {
    let engine = Arc::new(Engine::in_memory(config).unwrap());
    let router = create_router(Arc::new(AppState::new(engine)));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    format!("http://{}", addr)
}

/// GET a path and return (status, parsed body).
async fn get(base: &str, path: &str) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .get(format!("{}{}", base, path))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

/// POST JSON and return (status, parsed body).
async fn post_json(base: &str, path: &str, body: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{}{}", base, path))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

async fn delete(base: &str, path: &str) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .delete(format!("{}{}", base, path))
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn health_reports_version() {
    let base = start_test_server(test_config()).await;
    let (status, body) = get(&base, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

// ============================================================================
// Store / search
// ============================================================================

#[tokio::test]
async fn store_then_search_a_layer() {
    let base = start_test_server(test_config()).await;

    let (status, body) = post_json(
        &base,
        "/store/anchor",
        json!({"content": "Deploys happen on Tuesdays", "metadata": {"title": "deploy cadence"}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["layer"], "anchor");
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = post_json(&base, "/search/anchor", json!({"query": "deploys", "limit": 5})).await;
    assert_eq!(status, 200);
    assert_eq!(body["layer"], "anchor");
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["source_id"], id.as_str());
}

#[tokio::test]
async fn unknown_layer_is_bad_request() {
    let base = start_test_server(test_config()).await;
    let (status, body) = post_json(&base, "/store/vector", json!({"content": "x"})).await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn raw_store_requires_a_channel() {
    let base = start_test_server(test_config()).await;
    let (status, body) = post_json(&base, "/store/raw", json!({"content": "hello"})).await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "INVALID_INPUT");

    let (status, body) = post_json(
        &base,
        "/store/raw",
        json!({"content": "hello", "metadata": {"channel": "discord", "role": "user"}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["id"], "1");
}

async fn store_raw_events(base: &str, n: usize) {
    for i in 1..=n {
        let (status, _) = post_json(
            base,
            "/store/raw",
            json!({"content": format!("turn {i}"), "metadata": {"channel": "cli"}}),
        )
        .await;
        assert_eq!(status, 200);
    }
}

fn source_ids(body: &Value) -> Vec<String> {
    body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["source_id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn raw_search_after_a_timestamp() {
    let base = start_test_server(test_config()).await;
    store_raw_events(&base, 4).await;

    let (status, body) = post_json(
        &base,
        "/search/raw",
        json!({"after": "2000-01-01T00:00:00Z", "limit": 3}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(source_ids(&body), vec!["1", "2", "3"]);

    let (status, body) = post_json(&base, "/search/raw", json!({"after": "2999-01-01T00:00:00Z"})).await;
    assert_eq!(status, 200);
    assert!(source_ids(&body).is_empty());
}

#[tokio::test]
async fn raw_search_around_a_center() {
    let base = start_test_server(test_config()).await;
    store_raw_events(&base, 5).await;

    // Everything is before the center, so the whole window comes from that side.
    let (status, body) = post_json(
        &base,
        "/search/raw",
        json!({"center": "2999-01-01T00:00:00Z", "total": 2, "ratio": 1.0}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(source_ids(&body), vec!["4", "5"]);

    // Nothing before it: only the after-half of the window is filled.
    let (status, body) = post_json(
        &base,
        "/search/raw",
        json!({"center": "2000-01-01T00:00:00Z", "total": 4, "ratio": 0.5}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(source_ids(&body), vec!["1", "2"]);
}

#[tokio::test]
async fn raw_window_fields_are_validated() {
    let base = start_test_server(test_config()).await;
    store_raw_events(&base, 2).await;

    for body in [
        json!({"after": "2000-01-01T00:00:00Z", "center": "2000-01-01T00:00:00Z"}),
        json!({"after": "last tuesday"}),
        json!({"center": "2000-01-01T00:00:00Z", "ratio": 1.5}),
        json!({"total": 3}),
    ] {
        let (status, resp) = post_json(&base, "/search/raw", body).await;
        assert_eq!(status, 400);
        assert_eq!(resp["code"], "INVALID_INPUT");
    }

    let (status, resp) = post_json(
        &base,
        "/search/anchor",
        json!({"after": "2000-01-01T00:00:00Z"}),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(resp["code"], "INVALID_INPUT");
}

// ============================================================================
// Recall
// ============================================================================

#[tokio::test]
async fn recall_with_graph_down_returns_degraded_bundle() {
    let base = start_test_server(graph_down_config()).await;
    post_json(&base, "/store/anchor", json!({"content": "X"})).await;
    post_json(&base, "/store/crystal", json!({"content": "a week about X"})).await;

    let (status, body) = post_json(&base, "/recall", json!({"context": "x", "limit_per_layer": 10})).await;
    assert_eq!(status, 200);
    assert_eq!(body["layers"]["graph"]["unavailable"], true);
    assert_eq!(body["layers"]["anchor"]["count"], 1);
    assert_eq!(body["layers"]["crystal"]["count"], 1);
    assert_eq!(body["health"]["degraded"], true);
    assert_eq!(body["health"]["backlog_pending"], 0);
    assert_eq!(body["results"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn recall_rejects_zero_limit() {
    let base = start_test_server(test_config()).await;
    let (status, body) = post_json(&base, "/recall", json!({"context": "x", "limit_per_layer": 0})).await;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "INVALID_INPUT");
}

// ============================================================================
// Ingestion
// ============================================================================

#[tokio::test]
async fn manual_drain_updates_stats() {
    let base = start_test_server(test_config()).await;
    for text in ["Grace met Linus", "Linus reviewed the Scheduler", "Barbara joined Grace"] {
        let (status, _) = post_json(
            &base,
            "/store/raw",
            json!({"content": text, "metadata": {"channel": "slack"}}),
        )
        .await;
        assert_eq!(status, 200);
    }

    let (_, stats) = get(&base, "/ingest/stats").await;
    assert_eq!(stats["pending"], 3);

    let (status, report) = post_json(&base, "/ingest/backlog", json!({"batch_size": 2})).await;
    assert_eq!(status, 200);
    assert_eq!(report["start_id"], 1);
    assert_eq!(report["end_id"], 2);
    assert!(report["batch_id"].is_number());

    let (_, stats) = get(&base, "/ingest/stats").await;
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["last_batch"]["end_id"], 2);
    assert_eq!(stats["recent_batches"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn drain_with_graph_down_is_unavailable_and_keeps_backlog() {
    let base = start_test_server(graph_down_config()).await;
    post_json(
        &base,
        "/store/raw",
        json!({"content": "Grace met Linus", "metadata": {"channel": "slack"}}),
    )
    .await;

    let (status, body) = post_json(&base, "/ingest/backlog", json!({})).await;
    assert_eq!(status, 503);
    assert_eq!(body["code"], "UNAVAILABLE");

    let (_, stats) = get(&base, "/ingest/stats").await;
    assert_eq!(stats["pending"], 1);
}

// ============================================================================
// Crystals and graph maintenance
// ============================================================================

#[tokio::test]
async fn crystals_listing_respects_window() {
    let mut config = test_config();
    config.crystal.window = 2;
    let base = start_test_server(config).await;
    for n in 1..=3 {
        post_json(&base, "/store/crystal", json!({"content": format!("week {n}")})).await;
    }

    let (status, body) = get(&base, "/crystals").await;
    assert_eq!(status, 200);
    assert_eq!(body["window"], 2);
    assert_eq!(body["crystals"].as_array().unwrap().len(), 2);

    let (_, body) = get(&base, "/crystals?archive=true").await;
    let archived = body["crystals"].as_array().unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0]["summary"], "week 1");
}

#[tokio::test]
async fn delete_graph_edge() {
    let base = start_test_server(test_config()).await;
    post_json(&base, "/store/graph", json!({"content": "Grace mentored Linus"})).await;

    let (_, body) = post_json(&base, "/search/graph", json!({"query": "mentored"})).await;
    let edge = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["metadata"]["kind"] == "edge")
        .cloned()
        .unwrap();
    let id = edge["source_id"].as_str().unwrap();

    let (status, body) = delete(&base, &format!("/graph/edge/{id}")).await;
    assert_eq!(status, 200);
    assert_eq!(body["deleted"], true);

    let (status, body) = delete(&base, &format!("/graph/edge/{id}")).await;
    assert_eq!(status, 404);
    assert_eq!(body["code"], "NOT_FOUND");
}
