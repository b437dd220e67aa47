//! Rich-text deltas and the text CRDT for Quire blocks.
//!
//! Text blocks store their content as a quill-style [`Delta`]. Concurrent
//! edits to the same paragraph go through a [`TextCrdt`]: local edits become
//! a [`TextUpdate`] for the other replicas, remote updates merge back into the
//! authoritative document delta.
//!
//! ```text
//! local Delta ──apply_local_delta──▶ TextUpdate ──transport──▶ peer
//!                                                               │
//! merged Delta ◀──merge_remote_delta─────────────────────────────┘
//! ```
//!
//! [`SequenceText`] is the shipped implementation (an RGA). Anything else
//! honouring the trait can replace it.

pub mod delta;
pub mod error;
pub mod text;

pub use delta::{Attributes, Delta, DeltaOp};
pub use error::CrdtError;
pub use text::{ItemId, SequenceText, StateVector, TextOp, TextUpdate};

/// Result type for CRDT operations.
pub type Result<T> = std::result::Result<T, CrdtError>;

/// A replicated rich-text value.
///
/// Replicas that have merged the same updates hold the same content,
/// whatever the delivery order, and merging an update twice is a no-op.
pub trait TextCrdt {
    /// Apply a change delta made by this replica. Returns the update to ship.
    fn apply_local_delta(&mut self, delta: &Delta) -> Result<TextUpdate>;

    /// Merge an update from another replica. Returns the merged document.
    fn merge_remote_delta(&mut self, update: &TextUpdate) -> Result<Delta>;

    /// Current content as a document delta.
    fn to_delta(&self) -> Delta;

    fn state_vector(&self) -> StateVector;

    /// Everything a replica at `sv` is missing.
    fn update_since(&self, sv: &StateVector) -> TextUpdate;
}
