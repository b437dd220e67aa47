//! Wire operations exchanged with the remote store.
//!
//! Operations are the only externally observable unit of change. Every local
//! tree mutation becomes one or more `OpPayload`s; the sync engine stamps them
//! with a monotonically increasing version and the originating client.
//!
//! JSON shape (internally tagged):
//!
//! ```text
//! {"version": 7, "client": 42, "payload": {"type": "move", "blockId": "b",
//!  "newParentId": "root", "newPrevId": "a"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::NewBlock;
use crate::ids::{BlockId, ClientId};

/// Typed operation payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpPayload {
    /// Insert `block` under `parent_id`, after `prev_id` (None = first child).
    #[serde(rename_all = "camelCase")]
    Insert {
        block: NewBlock,
        parent_id: BlockId,
        prev_id: Option<BlockId>,
    },

    /// Deep-set `value` at `path` inside the block's payload.
    ///
    /// `merged` marks a `delta` written back by a text replica; the same
    /// content also travels as a text update. Untagged `delta` writes replace
    /// the text outright.
    #[serde(rename_all = "camelCase")]
    Update {
        block_id: BlockId,
        path: Vec<String>,
        value: Value,
        #[serde(default, skip_serializing_if = "is_false")]
        merged: bool,
    },

    /// Re-splice one block (its subtree follows implicitly).
    #[serde(rename_all = "camelCase")]
    Move {
        block_id: BlockId,
        new_parent_id: BlockId,
        new_prev_id: Option<BlockId>,
    },

    /// Re-splice the contiguous sibling run `range[0]..=range[1]`.
    #[serde(rename_all = "camelCase")]
    MoveRange {
        range: [BlockId; 2],
        new_parent_id: BlockId,
        new_prev_id: Option<BlockId>,
    },

    /// Remove a block and its whole subtree.
    #[serde(rename_all = "camelCase")]
    Remove { block_id: BlockId },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl OpPayload {
    /// The block this payload primarily targets (range start for `MoveRange`).
    pub fn target_block(&self) -> &BlockId {
        match self {
            OpPayload::Insert { block, .. } => &block.id,
            OpPayload::Update { block_id, .. } => block_id,
            OpPayload::Move { block_id, .. } => block_id,
            OpPayload::MoveRange { range, .. } => &range[0],
            OpPayload::Remove { block_id } => block_id,
        }
    }

    /// Check if this payload changes tree shape (as opposed to block content).
    pub fn is_structural(&self) -> bool {
        !matches!(self, OpPayload::Update { .. })
    }

    /// Wire name of the payload kind.
    pub fn kind(&self) -> &'static str {
        match self {
            OpPayload::Insert { .. } => "insert",
            OpPayload::Update { .. } => "update",
            OpPayload::Move { .. } => "move",
            OpPayload::MoveRange { .. } => "move_range",
            OpPayload::Remove { .. } => "remove",
        }
    }
}

/// A versioned operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Local version counter of the originating engine at send time.
    pub version: u64,
    /// Originating replica.
    pub client: ClientId,
    pub payload: OpPayload,
}

impl Operation {
    pub fn new(version: u64, client: ClientId, payload: OpPayload) -> Self {
        Self {
            version,
            client,
            payload,
        }
    }

    /// Replay ordering key: version first, client id breaks ties.
    pub fn order_key(&self) -> (u64, ClientId) {
        (self.version, self.client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockData, BlockType};
    use serde_json::json;

    #[test]
    fn test_payload_wire_shape() {
        let op = OpPayload::MoveRange {
            range: [BlockId::from("a"), BlockId::from("b")],
            new_parent_id: BlockId::from("root"),
            new_prev_id: Some(BlockId::from("c")),
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({
                "type": "move_range",
                "range": ["a", "b"],
                "newParentId": "root",
                "newPrevId": "c"
            })
        );
    }

    #[test]
    fn test_insert_roundtrips() {
        let op = Operation::new(
            3,
            ClientId(9),
            OpPayload::Insert {
                block: NewBlock::with_id("x", BlockType::Heading, BlockData::new()),
                parent_id: BlockId::from("root"),
                prev_id: None,
            },
        );
        let json = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
        assert_eq!(back.payload.kind(), "insert");
    }

    #[test]
    fn test_op_categories() {
        let update = OpPayload::Update {
            block_id: BlockId::from("a"),
            path: vec!["delta".into()],
            value: json!([]),
            merged: false,
        };
        assert!(!update.is_structural());
        assert_eq!(update.target_block(), "a");
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"type": "update", "blockId": "a", "path": ["delta"], "value": []})
        );

        let remove = OpPayload::Remove { block_id: BlockId::from("a") };
        assert!(remove.is_structural());
    }

    #[test]
    fn test_merged_flag_defaults_off() {
        let wire = json!({"type": "update", "blockId": "a", "path": ["delta"], "value": [], "merged": true});
        let op: OpPayload = serde_json::from_value(wire).unwrap();
        assert!(matches!(op, OpPayload::Update { merged: true, .. }));

        let plain: OpPayload =
            serde_json::from_value(json!({"type": "update", "blockId": "a", "path": [], "value": {}})).unwrap();
        assert!(matches!(plain, OpPayload::Update { merged: false, .. }));
    }

    #[test]
    fn test_order_key_breaks_ties_by_client() {
        let a = Operation::new(5, ClientId(1), OpPayload::Remove { block_id: "x".into() });
        let b = Operation::new(5, ClientId(2), OpPayload::Remove { block_id: "x".into() });
        assert!(a.order_key() < b.order_key());
    }
}
