//! Keeping the knowledge graph caught up with raw capture.
//!
//! [`backlog`] tracks which event ranges have been ingested, [`extract`] turns
//! event text into entities and edges, and [`drain`] ties the two to the graph
//! layer.

pub mod backlog;
pub mod drain;
pub mod extract;

pub use backlog::{BacklogStats, BacklogTracker, BatchRecord, Claim};
pub use drain::{DrainReport, Drainer};
pub use extract::{create_extractor, Extractor, HeuristicExtractor, RemoteExtractor};
