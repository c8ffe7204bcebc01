//! Layered memory for conversational agents, answered as one ambient recall.
//!
//! Strata keeps four storage tiers behind a single [`layers::Layer`] contract
//! and blends them on every request:
//!
//! | Layer | Holds | Score band |
//! |-------|-------|------------|
//! | **Raw capture** | Every conversation event, append-only | 0.30, stepping down by recency |
//! | **Semantic anchor** | Curated facts, hybrid vector + keyword search | 0.50 – 0.90 |
//! | **Knowledge graph** | Entities and time-stamped relationship edges | 0.10 – 0.95 |
//! | **Crystallization** | Chain-linked rolling summaries | 0.60, stepping down by recency |
//!
//! A recall fans out to every layer under one deadline. A layer that misses the
//! deadline or whose backing store is down is reported `unavailable` in the
//! bundle; the call itself still succeeds with whatever the other layers found.
//!
//! # Architecture
//!
//! - **Storage**: one shared SQLite file (WAL) with FTS5 for keyword search and
//!   [sqlite-vec](https://github.com/asg017/sqlite-vec) for anchor vectors
//! - **Graph**: a direct SQLite backend, or a remote graph service with the
//!   direct backend as fallback
//! - **Ingestion**: raw events are claimed in disjoint batches and turned into
//!   graph entities and edges by a pluggable extractor
//! - **Transport**: HTTP+JSON via axum, plus a CLI
//!
//! # Modules
//!
//! - [`config`]: configuration from TOML files and environment variables
//! - [`db`]: SQLite initialization, schema, migrations, and health checks
//! - [`embedding`]: text-to-vector providers for the anchor layer
//! - [`layers`]: the `Layer` trait and the four storage tiers
//! - [`ingest`]: backlog tracking, extraction, and draining into the graph
//! - [`lock`]: TTL locks shared by every process on the same file
//! - [`recall`]: the ambient recall orchestrator
//! - [`engine`]: wires every component from one config
//! - [`server`]: the HTTP API

pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod layers;
pub mod lock;
pub mod recall;
pub mod server;
