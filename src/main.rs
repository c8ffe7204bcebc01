use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use strata::config::StrataConfig;
use strata::engine::Engine;
use strata::layers::raw::RawWindow;
use strata::layers::LayerKind;
use strata::{cli, server};

#[derive(Parser)]
#[command(name = "strata", version, about = "Layered memory engine with ambient recall")]
struct Cli {
    /// Config file (defaults to ~/.strata/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve,
    /// Run one blended recall across every layer
    Recall {
        context: String,
        #[arg(long)]
        limit: Option<usize>,
        /// Print the raw bundle as JSON
        #[arg(long)]
        json: bool,
    },
    /// Query a single layer directly
    Search {
        layer: LayerKind,
        #[arg(default_value = "")]
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Raw layer only: events strictly after this RFC 3339 timestamp
        #[arg(long, conflicts_with = "center")]
        after: Option<String>,
        /// Raw layer only: reconstruct context around this RFC 3339 timestamp
        #[arg(long)]
        center: Option<String>,
        /// Window size for --center (defaults to --limit)
        #[arg(long, requires = "center")]
        total: Option<usize>,
        /// Share of the --center window taken from before the timestamp
        #[arg(long, requires = "center")]
        ratio: Option<f64>,
    },
    /// Drain the ingestion backlog into the knowledge graph
    Drain {
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long, default_value_t = 100)]
        max_batches: usize,
    },
    /// Show backlog, graph and crystal statistics
    Stats,
    /// Run database and backend diagnostics
    Doctor,
    /// List current (or archived) crystals
    Crystals {
        #[arg(long)]
        archive: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Manage the local embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the ONNX model and tokenizer to the embedding cache dir
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => StrataConfig::load_from(path)?,
        None => StrataConfig::load()?,
    };

    // Logs go to stderr so command output stays pipeable.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => {
            let engine = Arc::new(Engine::open(config)?);
            server::serve(engine).await?;
        }
        Command::Recall { context, limit, json } => {
            cli::recall::recall(config, &context, limit, json).await?;
        }
        Command::Search {
            layer,
            query,
            limit,
            after,
            center,
            total,
            ratio,
        } => {
            let window = RawWindow {
                after,
                center,
                total,
                ratio,
            };
            cli::search::search(config, layer, &query, limit, window).await?;
        }
        Command::Drain {
            batch_size,
            max_batches,
        } => {
            cli::drain::drain(config, batch_size, max_batches).await?;
        }
        Command::Stats => cli::stats::stats(config).await?,
        Command::Doctor => cli::doctor::doctor(config).await?,
        Command::Crystals { archive, limit } => {
            cli::crystals::crystals(config, archive, limit).await?;
        }
        Command::Model { action } => match action {
            ModelAction::Download => cli::model::download(&config.embedding).await?,
        },
    }

    Ok(())
}
