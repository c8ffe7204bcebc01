//! Terminal front-ends over the [`Engine`](crate::engine::Engine).
//!
//! Each command opens the configured database itself, so they can run next to
//! a live `strata serve` sharing the same file.

pub mod crystals;
pub mod doctor;
pub mod drain;
pub mod model;
pub mod recall;
pub mod search;
pub mod stats;

use crate::layers::truncate_preview;

/// One-line preview for terminal listings.
pub(crate) fn preview(content: &str) -> String {
    truncate_preview(&content.replace('\n', " "), 120)
}
