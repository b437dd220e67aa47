//! Error types for the document crate.
//!
//! Tree operations never fail with an error: unknown ids and rejected
//! structural edits return `None`. The errors here cover hydration, config,
//! the remote transport, and text merging.

use quire_crdt::CrdtError;
use quire_types::BlockId;
use thiserror::Error;

/// Errors opening or validating a document.
#[derive(Error, Debug)]
pub enum DocumentError {
    /// The snapshot's `rootId` has no record.
    #[error("root block {0} missing from snapshot")]
    MissingRoot(BlockId),

    /// A `next`/`firstChild` link names a block the snapshot doesn't hold.
    #[error("block {from} links to unknown block {to}")]
    DanglingReference { from: BlockId, to: BlockId },

    /// A block is reachable through more than one link.
    #[error("block {0} is linked more than once")]
    DuplicateReference(BlockId),

    /// A structural invariant does not hold.
    #[error("tree invariant violated: {0}")]
    Invariant(String),

    /// Config values out of range.
    #[error("invalid config: {0}")]
    Config(String),

    /// Config file could not be parsed.
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure pushing operations to the remote store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The store could not be reached.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The store refused the batch.
    #[error("remote rejected batch: {0}")]
    Rejected(String),
}

/// Errors surfaced by the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Flush failed; the operations stay queued.
    #[error("flush failed: {0}")]
    Transport(#[from] TransportError),

    /// Text merge failed.
    #[error("text merge failed: {0}")]
    Crdt(#[from] CrdtError),
}
