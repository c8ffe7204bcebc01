//! CLI `doctor` command: database diagnostics plus a graph reachability check.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::config::{GraphBackendKind, StrataConfig};
use crate::db::{self, Db};
use crate::embedding;
use crate::layers::graph::backend_for;

/// Run database diagnostics and print a health report.
pub async fn doctor(config: StrataConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `strata serve` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;
    drop(conn);

    let configured_model = embedding::configured_model_id(&config.embedding);

    println!("Strata Health Report");
    println!("====================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        {}", report.sqlite_vec_version);
    println!();
    println!("Embedding model:");
    println!("  Stored:          {}", report.embedding_model.as_deref().unwrap_or("(not set)"));
    println!("  Configured:      {configured_model}");
    match report.embedding_model {
        Some(ref stored) if stored != &configured_model => {
            println!("  WARNING: model mismatch! Anchor similarity will be unreliable.");
        }
        Some(_) => println!("  Status:          OK (match)"),
        None => {}
    }
    if config.embedding.provider == "local" {
        let (model_path, tokenizer_path) = embedding::local::model_files(&config.embedding);
        if model_path.exists() && tokenizer_path.exists() {
            println!("  Model files:     present in {}", config.embedding.cache_dir);
        } else {
            println!("  Model files:     MISSING. Run `strata model download`.");
        }
    }
    println!();
    println!("Row counts:");
    println!("  Raw events:      {}", report.event_count);
    println!("  Ingest batches:  {}", report.batch_count);
    println!("  Anchors:         {}", report.anchor_count);
    println!("  Graph entities:  {}", report.entity_count);
    println!("  Graph edges:     {}", report.edge_count);
    println!("  Crystals:        {}", report.crystal_count);
    println!("  Locks:           {}", report.lock_count);
    println!();

    let graph_mode = format!("{:?} (fallback {:?})", config.graph.backend, config.graph.fallback);
    let check_timeout = Duration::from_millis(config.graph.timeout_ms.max(500) * 2);
    println!("Knowledge graph:   {}", graph_mode.to_lowercase());
    if config.graph.backend == GraphBackendKind::None && config.graph.fallback == GraphBackendKind::None {
        println!("  Status:          disabled");
    } else {
        let db = Db::open(&db_path)?;
        for kind in [config.graph.backend, config.graph.fallback] {
            let Some(backend) = backend_for(kind, &db, &config.graph)? else {
                continue;
            };
            match tokio::time::timeout(check_timeout, backend.counts()).await {
                Ok(Ok(counts)) => println!(
                    "  {:<16} reachable ({} entities, {} edges)",
                    format!("{}:", backend.name()),
                    counts.entities,
                    counts.edges
                ),
                Ok(Err(e)) => println!("  {:<16} UNAVAILABLE ({e})", format!("{}:", backend.name())),
                Err(_) => println!(
                    "  {:<16} UNAVAILABLE (no answer within {}ms)",
                    format!("{}:", backend.name()),
                    check_timeout.as_millis()
                ),
            }
        }
    }
    println!();

    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Stop every process sharing this file.");
        println!("  2. Restore from a backup: cp backup.db {}", db_path.display());
    }

    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
