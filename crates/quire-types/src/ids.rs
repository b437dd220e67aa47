//! Typed identifiers for blocks and replicas.
//!
//! `BlockId` is an opaque string on the wire: hydration snapshots produced by
//! other clients may use any id scheme, so we never parse it. Locally minted ids
//! are UUIDv7 hex (time-ordered, globally unique). `ClientId` is a 64-bit replica
//! id used for op stamping and CRDT item ordering.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A block identifier (opaque string, UUIDv7 hex when minted locally).
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    /// Mint a new time-ordered block ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().as_simple().to_string())
    }

    /// Borrow the raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines only. Never a lookup key.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Consume into the inner string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BlockId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&String> for BlockId {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

impl AsRef<str> for BlockId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for BlockId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for BlockId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.short())
    }
}

/// A replica identifier.
///
/// Ordered numerically; the ordering is load-bearing for CRDT tie-breaks and
/// for the equal-version rule when replaying remote operations.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Reserved id for content seeded from a snapshot.
    ///
    /// Every replica seeding text from the same snapshot mints the same item
    /// ids under this client, so seeded state merges without duplication.
    pub const GENESIS: ClientId = ClientId(0);

    /// Create a new random client id (never `GENESIS`).
    pub fn new() -> Self {
        let bytes = *uuid::Uuid::now_v7().as_bytes();
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&bytes[8..]);
        Self(u64::from_le_bytes(tail).max(1))
    }

    /// The raw value.
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Check if this is the genesis sentinel.
    pub fn is_genesis(&self) -> bool {
        self.0 == 0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for ClientId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({:x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_block_ids_are_unique() {
        let a = BlockId::new();
        let b = BlockId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_block_id_is_transparent_on_the_wire() {
        let id = BlockId::from("page-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"page-1\"");
        let back: BlockId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_short_handles_short_and_multibyte_ids() {
        assert_eq!(BlockId::from("abc").short(), "abc");
        assert_eq!(BlockId::from("0123456789").short(), "01234567");
        assert_eq!(BlockId::from("ßßßßßßßßßß").short(), "ßßßßßßßß");
    }

    #[test]
    fn test_client_id_never_genesis() {
        for _ in 0..64 {
            assert!(!ClientId::new().is_genesis());
        }
        assert!(ClientId::GENESIS.is_genesis());
    }
}
