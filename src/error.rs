//! Error taxonomy shared by every layer.
//!
//! Unavailable errors are recoverable and get converted into degraded results by
//! the recall orchestrator. Invalid input is rejected synchronously. Conflicts
//! mean another writer won a race and the caller should retry with fresh state.

use thiserror::Error;

use crate::layers::LayerKind;

#[derive(Error, Debug)]
pub enum LayerError {
    /// The backing store did not answer within its deadline or refused the connection.
    #[error("{layer} layer unavailable: {reason}")]
    Unavailable { layer: LayerKind, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Text-to-entities extraction failed for a single item.
    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LayerError>;

impl LayerError {
    pub fn unavailable(layer: LayerKind, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            layer,
            reason: reason.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Conflict(_) | Self::Http(_) | Self::Extraction(_)
        )
    }

    /// Short machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "UNAVAILABLE",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Conflict(_) => "CONFLICT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Extraction(_) => "EXTRACTION_FAILED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_recoverable() {
        let err = LayerError::unavailable(LayerKind::Graph, "connection refused");
        assert!(err.is_unavailable());
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "graph layer unavailable: connection refused");
    }

    #[test]
    fn invalid_input_is_not_recoverable() {
        let err = LayerError::InvalidInput("empty content".into());
        assert!(!err.is_recoverable());
        assert_eq!(err.code(), "INVALID_INPUT");
    }
}
