use anyhow::Result;

use super::preview;
use crate::config::StrataConfig;
use crate::engine::Engine;
use crate::layers::LayerKind;
use crate::recall::RecallRequest;

/// Run one ambient recall and print the bundle, grouped by layer.
pub async fn recall(config: StrataConfig, context: &str, limit: Option<usize>, json: bool) -> Result<()> {
    let engine = Engine::open(config)?;
    let request = RecallRequest {
        context: context.to_string(),
        limit_per_layer: limit,
        layers: None,
    };
    let bundle = engine.recall.recall(&request).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&bundle)?);
        return Ok(());
    }

    println!(
        "Recall: {} result(s) in {}ms{}",
        bundle.results.len(),
        bundle.health.latency_ms,
        if bundle.health.degraded { " (degraded)" } else { "" }
    );
    match bundle.health.backlog_pending {
        Some(n) => println!("Backlog pending:   {n}"),
        None => println!("Backlog pending:   unknown"),
    }
    println!();

    for kind in LayerKind::ALL {
        let Some(health) = bundle.layers.get(&kind) else {
            continue;
        };
        if health.unavailable {
            println!(
                "[{kind}] unavailable ({})",
                health.error.as_deref().unwrap_or("no response")
            );
            continue;
        }
        println!("[{kind}] {} result(s), {}ms", health.count, health.latency_ms);
        for result in bundle.results_for(kind) {
            println!("  {:.3}  {}", result.score, preview(&result.content));
        }
        println!();
    }

    Ok(())
}
