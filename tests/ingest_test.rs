mod helpers;

use std::sync::Arc;
use std::thread;

use strata::db::{self, Db};
use strata::ingest::backlog::{self, BacklogTracker};
use strata::layers::{Layer, LayerKind};
use tempfile::TempDir;

use helpers::{claim_ttl, meta, seed_events, test_engine};

#[tokio::test]
async fn twenty_five_events_two_channels() {
    let db = Db::open_in_memory().unwrap();
    seed_events(&db, 25, &["discord", "slack"]);

    let first = BacklogTracker::new(db.clone(), "drainer-a", claim_ttl());
    let second = BacklogTracker::new(db.clone(), "drainer-b", claim_ttl());

    let claim = first.take_batch(20).await.unwrap().unwrap();
    assert_eq!((claim.start_id, claim.end_id), (1, 20));
    assert_eq!(claim.events.len(), 20);
    assert_eq!(claim.channels(), vec!["discord", "slack"]);

    // Issued before the first mark lands: must not touch ids 1..=20.
    let other = second.take_batch(20).await.unwrap().unwrap();
    assert!(other.start_id > 20);
    assert_eq!((other.start_id, other.end_id), (21, 25));

    first
        .mark_batched(claim.start_id, claim.end_id, claim.channels())
        .await
        .unwrap();
    assert_eq!(first.count_pending().await.unwrap(), 5);

    second
        .mark_batched(other.start_id, other.end_id, other.channels())
        .await
        .unwrap();
    assert_eq!(second.count_pending().await.unwrap(), 0);
    assert!(first.take_batch(20).await.unwrap().is_none());
}

#[tokio::test]
async fn pending_count_moves_monotonically() {
    let db = Db::open_in_memory().unwrap();
    let tracker = BacklogTracker::new(db.clone(), "solo", claim_ttl());
    let mut last = tracker.count_pending().await.unwrap();
    assert_eq!(last, 0);

    for round in 0..4 {
        seed_events(&db, 6, &["discord"]);
        let grown = tracker.count_pending().await.unwrap();
        assert!(grown >= last, "round {round}: storing events lowered pending");
        last = grown;

        let claim = tracker.take_batch(4).await.unwrap().unwrap();
        tracker
            .mark_batched(claim.start_id, claim.end_id, claim.channels())
            .await
            .unwrap();
        let shrunk = tracker.count_pending().await.unwrap();
        assert!(shrunk <= last, "round {round}: marking raised pending");
        last = shrunk;
    }
}

#[tokio::test]
async fn overlapping_mark_is_a_conflict() {
    let db = Db::open_in_memory().unwrap();
    seed_events(&db, 10, &["discord"]);
    let tracker = BacklogTracker::new(db.clone(), "solo", claim_ttl());

    tracker.mark_batched(1, 6, vec!["discord".into()]).await.unwrap();
    let err = tracker
        .mark_batched(4, 10, vec!["discord".into()])
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT");
    assert_eq!(tracker.count_pending().await.unwrap(), 4);
}

/// Several processes, each with its own connection to the same file, drain
/// concurrently. Every id ends up in exactly one batch.
#[test]
fn concurrent_drainers_cover_every_id_exactly_once() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("shared.db");
    let total = {
        let db = Db::open(&path).unwrap();
        seed_events(&db, 103, &["discord", "slack", "cli"])
    };
    assert_eq!(total, 103);

    let path = Arc::new(path);
    let workers: Vec<_> = (0..4)
        .map(|w| {
            let path = Arc::clone(&path);
            thread::spawn(move || {
                let mut conn = db::open_database(path.as_ref()).unwrap();
                let holder = format!("worker-{w}");
                let mut ranges = Vec::new();
                loop {
                    let claim = backlog::take_batch(
                        &mut conn,
                        7,
                        &holder,
                        claim_ttl(),
                        chrono::Utc::now(),
                    )
                    .unwrap();
                    let Some(claim) = claim else { break };
                    backlog::mark_batched(
                        &mut conn,
                        claim.start_id,
                        claim.end_id,
                        &claim.channels(),
                        &holder,
                    )
                    .unwrap();
                    ranges.push((claim.start_id, claim.end_id));
                }
                ranges
            })
        })
        .collect();

    let mut ranges: Vec<(i64, i64)> = workers
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    ranges.sort();

    let mut next = 1;
    for (start, end) in &ranges {
        assert_eq!(*start, next, "gap or overlap before {start}");
        assert!(end >= start);
        next = end + 1;
    }
    assert_eq!(next, total + 1);

    let conn = db::open_database(path.as_ref()).unwrap();
    let stats = backlog::stats(&conn).unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.open_claims, 0);
    assert_eq!(stats.completed_batches as usize, ranges.len());
}

#[tokio::test]
async fn drained_events_become_searchable_graph_facts() {
    let engine = test_engine();
    let raw = engine.layer(LayerKind::Raw);
    let channel = meta(&[("channel", "discord".into())]);
    raw.store("Grace met Linus to plan the Scheduler rewrite", &channel)
        .await
        .unwrap();
    raw.store("Barbara reviewed the Scheduler patch", &channel)
        .await
        .unwrap();
    assert_eq!(engine.backlog.count_pending().await.unwrap(), 2);

    let report = engine.drainer.drain(20).await.unwrap();
    assert_eq!(report.events, 2);
    assert_eq!(report.skipped, 0);
    assert!(report.batch_id.is_some());
    assert_eq!(engine.backlog.count_pending().await.unwrap(), 0);

    let results = engine.layer(LayerKind::Graph).search("Scheduler", 10).await.unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.layer == LayerKind::Graph));
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

    // Draining again is a no-op and never re-ingests.
    assert!(engine.drainer.drain(20).await.unwrap().is_empty());
}
