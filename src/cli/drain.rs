use anyhow::Result;

use crate::config::StrataConfig;
use crate::engine::Engine;

/// Drain the ingestion backlog into the knowledge graph.
///
/// Stops after `max_batches` or once nothing is pending.
pub async fn drain(config: StrataConfig, batch_size: Option<usize>, max_batches: usize) -> Result<()> {
    let batch_size = batch_size.unwrap_or(config.ingest.batch_size);
    anyhow::ensure!(batch_size > 0, "--batch-size must be positive");

    let engine = Engine::open(config)?;
    let before = engine.backlog.count_pending().await?;
    if before == 0 {
        println!("Backlog is empty.");
        return Ok(());
    }

    let reports = engine.drainer.drain_all(batch_size, max_batches).await?;
    for report in &reports {
        println!(
            "  batch {:>4}  events {}-{}  ingested {}  skipped {}  edges +{}{}",
            report.batch_id.unwrap_or_default(),
            report.start_id,
            report.end_id,
            report.ingested,
            report.skipped,
            report.edges_created,
            if report.reissued { "  (reissued)" } else { "" }
        );
    }

    let after = engine.backlog.count_pending().await?;
    println!();
    println!("Drained {} batch(es); pending {before} -> {after}", reports.len());
    Ok(())
}
