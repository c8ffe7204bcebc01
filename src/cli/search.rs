use anyhow::{bail, Result};

use super::preview;
use crate::config::StrataConfig;
use crate::engine::Engine;
use crate::layers::raw::RawWindow;
use crate::layers::LayerKind;

/// Query a single layer directly, bypassing the blended recall. A non-empty
/// `window` lists raw events by time instead of matching `query`.
pub async fn search(
    config: StrataConfig,
    layer: LayerKind,
    query: &str,
    limit: usize,
    window: RawWindow,
) -> Result<()> {
    let engine = Engine::open(config)?;
    let results = if window.is_empty() {
        engine.layer(layer).search(query, limit).await?
    } else if layer == LayerKind::Raw {
        engine.raw.window(window, limit).await?
    } else {
        bail!("--after and --center only apply to the raw layer");
    };

    if results.is_empty() {
        println!("No results found in the {layer} layer.");
        return Ok(());
    }

    println!("Found {} result(s) in the {layer} layer\n", results.len());
    for (i, result) in results.iter().enumerate() {
        println!("  {}. {} (score: {:.3})", i + 1, result.source_id, result.score);
        println!("     {}", preview(&result.content));
        println!();
    }

    Ok(())
}
