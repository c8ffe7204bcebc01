use anyhow::Result;

use super::preview;
use crate::config::StrataConfig;
use crate::engine::Engine;

/// List the current crystals, or a page of the archive.
pub async fn crystals(config: StrataConfig, archive: bool, limit: usize) -> Result<()> {
    let engine = Engine::open(config)?;
    let crystals = if archive {
        engine.crystal.archive(limit, 0).await?
    } else {
        engine.crystal.current().await?
    };

    if crystals.is_empty() {
        println!("No {} crystals.", if archive { "archived" } else { "current" });
        return Ok(());
    }

    if archive {
        println!("Archived crystals (newest first)");
    } else {
        println!(
            "Current crystals ({} of window {})",
            crystals.len(),
            engine.crystal.window()
        );
    }
    println!("{}", "=".repeat(40));
    for c in &crystals {
        let span = match (c.span_start, c.span_end) {
            (Some(s), Some(e)) => format!("events {s}-{e}"),
            _ => "no span".to_string(),
        };
        let link = c
            .predecessor
            .map(|p| format!("<- #{p}"))
            .unwrap_or_else(|| "(chain start)".into());
        println!("  #{:<4} {}  {span}  {link}", c.seq, c.created_at);
        println!("        {}", preview(&c.summary));
    }

    Ok(())
}
