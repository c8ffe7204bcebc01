use anyhow::Result;

use crate::config::StrataConfig;
use crate::engine::Engine;
use crate::lock::names;

/// Display backlog, graph and crystal statistics in the terminal.
pub async fn stats(config: StrataConfig) -> Result<()> {
    let engine = Engine::open(config)?;
    let backlog = engine.backlog.stats().await?;

    println!("Ingestion Backlog");
    println!("{}", "=".repeat(40));
    println!("  Pending events:      {}", backlog.pending);
    println!("  Newest event id:     {}", backlog.max_event_id);
    println!("  Batched through:     {}", backlog.batched_through);
    println!("  Completed batches:   {}", backlog.completed_batches);
    println!("  Open claims:         {}", backlog.open_claims);
    if let Some(ref last) = backlog.last_batch {
        println!(
            "  Last batch:          #{} events {}-{} by {} at {}",
            last.id,
            last.start_id,
            last.end_id,
            last.holder,
            last.completed_at.as_deref().unwrap_or("(open)")
        );
    }
    println!();

    println!("Knowledge Graph");
    println!("{}", "=".repeat(40));
    match engine.graph.counts().await {
        Ok(counts) => {
            println!("  Entities:            {}", counts.entities);
            println!("  Edges:               {}", counts.edges);
            println!("  Episodes:            {}", counts.episodes);
        }
        Err(e) => println!("  unavailable: {e}"),
    }
    println!();

    let current = engine.crystal.current().await?;
    println!("Crystals");
    println!("{}", "=".repeat(40));
    println!("  Current:             {} (window {})", current.len(), engine.crystal.window());
    if let Some(newest) = current.first() {
        println!("  Newest:              #{} at {}", newest.seq, newest.created_at);
    }
    println!();

    println!("Locks");
    println!("{}", "=".repeat(40));
    for name in [names::INGEST_DRAIN, names::CRYSTAL_ROTATE] {
        match engine.locks.current(name).await? {
            Some(lock) => {
                let until = chrono::DateTime::from_timestamp_millis(lock.expires_at_ms)
                    .map(crate::db::format_ts)
                    .unwrap_or_else(|| lock.expires_at_ms.to_string());
                println!("  {name:<20} held by {} until {until}", lock.holder);
            }
            None => println!("  {name:<20} free"),
        }
    }

    Ok(())
}
