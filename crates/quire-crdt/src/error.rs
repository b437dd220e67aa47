//! Error types for delta and CRDT operations.

use thiserror::Error;

/// Errors that can occur while applying deltas or merging CRDT updates.
#[derive(Error, Debug)]
pub enum CrdtError {
    /// A retain or delete ran past the end of the text.
    #[error("delta position {pos} out of bounds for text with length {len}")]
    PositionOutOfBounds { pos: usize, len: usize },

    /// A stored `delta` payload is not a valid delta.
    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    /// A remote update carries an op that can never integrate.
    #[error("invalid text update: {0}")]
    InvalidUpdate(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
