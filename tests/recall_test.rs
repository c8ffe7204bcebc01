mod helpers;

use std::time::{Duration, Instant};

use strata::engine::Engine;
use strata::layers::{Layer, LayerKind};
use strata::recall::RecallRequest;

use helpers::{graph_down_config, meta, test_config};

#[tokio::test]
async fn graph_outage_degrades_instead_of_failing() {
    let config = graph_down_config();
    let deadline = config.recall.deadline();
    let engine = Engine::in_memory(config).unwrap();

    engine
        .layer(LayerKind::Anchor)
        .store("X", &meta(&[("title", "X".into())]))
        .await
        .unwrap();
    engine
        .layer(LayerKind::Crystal)
        .store("Week one: the team agreed on X.", &meta(&[]))
        .await
        .unwrap();

    let started = Instant::now();
    let bundle = engine.recall.recall(&RecallRequest::new("x", 10)).await.unwrap();
    assert!(started.elapsed() < deadline + Duration::from_millis(500));

    assert_eq!(bundle.results_for(LayerKind::Anchor).count(), 1);
    assert_eq!(bundle.results_for(LayerKind::Graph).count(), 0);
    assert_eq!(bundle.results_for(LayerKind::Crystal).count(), 1);

    let graph = &bundle.layers[&LayerKind::Graph];
    assert!(graph.unavailable);
    assert!(!graph.available);
    assert!(graph.error.is_some());
    assert!(bundle.layers[&LayerKind::Anchor].available);
    assert!(bundle.layers[&LayerKind::Crystal].available);
    assert!(bundle.health.degraded);
    assert_eq!(bundle.health.backlog_pending, Some(0));
}

#[tokio::test]
async fn healthy_recall_blends_every_layer() {
    let engine = Engine::in_memory(test_config()).unwrap();
    let channel = meta(&[("channel", "discord".into())]);

    engine
        .layer(LayerKind::Raw)
        .store("Grace said the Scheduler ships on Friday", &channel)
        .await
        .unwrap();
    engine
        .layer(LayerKind::Anchor)
        .store("The Scheduler is owned by Grace", &meta(&[]))
        .await
        .unwrap();
    engine
        .layer(LayerKind::Graph)
        .store("Grace leads the Scheduler team with Linus", &meta(&[]))
        .await
        .unwrap();
    engine
        .layer(LayerKind::Crystal)
        .store("Scheduler planning wrapped up", &meta(&[]))
        .await
        .unwrap();

    let bundle = engine
        .recall
        .recall(&RecallRequest::new("Scheduler", 10))
        .await
        .unwrap();

    for kind in LayerKind::ALL {
        let health = &bundle.layers[&kind];
        assert!(health.available, "{kind} should answer");
        assert!(health.count > 0, "{kind} should contribute results");
    }
    assert!(!bundle.health.degraded);
    assert_eq!(bundle.health.backlog_pending, Some(1));
    assert!(bundle.results.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn requested_layers_gate_the_fan_out() {
    let engine = Engine::in_memory(graph_down_config()).unwrap();
    let request = RecallRequest {
        context: "anything".into(),
        limit_per_layer: Some(5),
        layers: Some(vec![LayerKind::Anchor, LayerKind::Crystal]),
    };
    let bundle = engine.recall.recall(&request).await.unwrap();
    assert!(!bundle.layers.contains_key(&LayerKind::Graph));
    assert!(!bundle.layers.contains_key(&LayerKind::Raw));
    assert!(!bundle.health.degraded);
}

#[tokio::test]
async fn invalid_limits_are_rejected() {
    let engine = Engine::in_memory(test_config()).unwrap();
    let zero = engine.recall.recall(&RecallRequest::new("x", 0)).await;
    assert_eq!(zero.unwrap_err().code(), "INVALID_INPUT");
    let huge = engine.recall.recall(&RecallRequest::new("x", 10_000)).await;
    assert_eq!(huge.unwrap_err().code(), "INVALID_INPUT");
}
