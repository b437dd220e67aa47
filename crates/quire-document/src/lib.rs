//! Block-tree document model for Quire.
//!
//! A document is a tree of typed blocks held in an arena ([`BlockChain`]).
//! Structure is kept in four id links per block (`parent`, `prev`, `next`,
//! `first_child`); the id map is the single owner of every block.
//!
//! # Data flow
//!
//! ```text
//!  intent ──▶ BlockChain ──change──▶ SyncEngine ──ops──▶ RemoteStore
//!                 ▲                      │
//!                 └──── remote ops ◀─────┘
//!                 │
//!  layout ──▶ PositionObserver ──▶ RegionGrid ──▶ get_intersect_blocks
//! ```
//!
//! [`DocumentController`] wires these together for one open document.
//!
//! # Consistency
//!
//! - Text: converges through the text CRDT regardless of delivery order.
//! - Structure: last applied wins, ordered by `(version, client)`.
//! - Unknown ids: every tree operation returns `None` and changes nothing.

pub mod block_chain;
pub mod config;
pub mod controller;
pub mod error;
pub mod region_grid;
pub mod remote;
pub mod sync;
pub mod viewport;

pub use block_chain::{Block, BlockChain, BlockChange, ChangeKind, ChangeOrigin, Traverse};
pub use config::DocumentConfig;
pub use controller::DocumentController;
pub use error::{DocumentError, SyncError, TransportError};
pub use region_grid::RegionGrid;
pub use remote::{MemoryRemote, RemoteStore};
pub use sync::SyncEngine;
pub use viewport::PositionObserver;
