//! Shared block, operation, and identity types for Quire.
//!
//! This crate is the vocabulary every other Quire crate speaks: typed IDs,
//! block types and payloads, the hydration format a document-open call
//! supplies, and the operation records exchanged with the remote store. It has
//! **no internal quire dependencies**.
//!
//! # Key Types
//!
//! |------------------|-----------------------------------------------------|
//! | Type             | Purpose                                             |
//! |------------------|-----------------------------------------------------|
//! | [`BlockId`]      | Stable opaque block identity                        |
//! | [`ClientId`]     | Which replica produced an op or a CRDT item         |
//! | [`BlockType`]    | What a block *is* (page, heading, list, ...)        |
//! | [`BlockData`]    | Type-dependent JSON payload with deep-set by path   |
//! | [`DocumentData`] | Flat hydration snapshot (`rootId` + id → record)    |
//! | [`Operation`]    | Versioned wire operation sent to the remote store   |
//! | [`RemoteEvent`]  | Change notification folded back into local ops      |
//! | [`BlockRect`]    | Screen rectangle of a rendered block                |
//! |------------------|-----------------------------------------------------|

pub mod block;
pub mod event;
pub mod geometry;
pub mod ids;
pub mod ops;

pub use block::{
    BlockData, BlockRecord, BlockType, DataPathError, DocumentData, NewBlock, SplitBehavior,
    SplitRelationship,
};
pub use event::{RemoteCommand, RemoteEvent};
pub use geometry::BlockRect;
pub use ids::{BlockId, ClientId};
pub use ops::{OpPayload, Operation};

/// Current time as Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
