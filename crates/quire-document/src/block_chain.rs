//! Arena-backed block tree.
//!
//! Every block lives in one `HashMap<BlockId, Block>`. Structure is four
//! optional ids per block, so splicing is a handful of map updates:
//!
//! ```text
//!   root (Page)
//!    └─ first_child ─▶ A ──next──▶ B ──next──▶ C
//!                      ▲ prev ─────┘ ▲ prev ───┘
//!                      └─ first_child ─▶ A1 ──▶ A2
//! ```
//!
//! Invariants held after every mutation:
//!
//! | Link                         | Holds when                                   |
//! |------------------------------|----------------------------------------------|
//! | `b.prev == None`, has parent | `parent.first_child == b`                    |
//! | `b.prev == Some(p)`          | `p.next == b`, same parent                   |
//! | `b.first_child == Some(c)`   | `c.parent == b`, `c.prev == None`            |
//! | every map entry              | reachable from the root exactly once         |
//!
//! Operations referencing an unknown id return `None` and change nothing, so a
//! racing remote delete never breaks a local edit. Moves that would put a block
//! under itself are rejected the same way, and the root is never moved or removed.
//!
//! Each mutation emits one [`BlockChange`] to the single subscriber.

use std::collections::{HashMap, HashSet};

use quire_types::{BlockData, BlockId, BlockRecord, BlockType, DocumentData, NewBlock, OpPayload};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::DocumentError;

// ============================================================================
// Block
// ============================================================================

/// One node of the document tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub ty: BlockType,
    pub data: BlockData,
    pub parent: Option<BlockId>,
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
    pub first_child: Option<BlockId>,
}

impl Block {
    fn detached(content: NewBlock) -> Self {
        Self {
            id: content.id,
            ty: content.ty,
            data: content.data,
            parent: None,
            prev: None,
            next: None,
            first_child: None,
        }
    }

    /// Id, type, and payload, without links.
    pub fn content(&self) -> NewBlock {
        NewBlock::with_id(self.id.clone(), self.ty, self.data.clone())
    }
}

// ============================================================================
// Change events
// ============================================================================

/// Who caused a change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// This replica's user; becomes an outgoing operation.
    #[default]
    Local,
    /// Replay of a remote operation or notification.
    Remote,
    /// Text content written back by a replica. The sync engine logs these
    /// itself, tagged as merged.
    Replica,
}

/// What changed.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeKind {
    Inserted {
        block: NewBlock,
        parent_id: BlockId,
        prev_id: Option<BlockId>,
    },
    Updated {
        block_id: BlockId,
        path: Vec<String>,
        value: Value,
    },
    Moved {
        block_id: BlockId,
        new_parent_id: BlockId,
        new_prev_id: Option<BlockId>,
        old_parent_id: BlockId,
        old_prev_id: Option<BlockId>,
    },
    RangeMoved {
        start_id: BlockId,
        end_id: BlockId,
        new_parent_id: BlockId,
        new_prev_id: Option<BlockId>,
        old_parent_id: BlockId,
        old_prev_id: Option<BlockId>,
    },
    Removed {
        block_id: BlockId,
        old_parent_id: BlockId,
        old_prev_id: Option<BlockId>,
        /// Every removed id, descendants first.
        removed: Vec<BlockId>,
    },
}

impl ChangeKind {
    /// The wire operation that reproduces this change.
    pub fn to_payload(&self) -> OpPayload {
        match self {
            ChangeKind::Inserted {
                block,
                parent_id,
                prev_id,
            } => OpPayload::Insert {
                block: block.clone(),
                parent_id: parent_id.clone(),
                prev_id: prev_id.clone(),
            },
            ChangeKind::Updated { block_id, path, value } => OpPayload::Update {
                block_id: block_id.clone(),
                path: path.clone(),
                value: value.clone(),
                merged: false,
            },
            ChangeKind::Moved {
                block_id,
                new_parent_id,
                new_prev_id,
                ..
            } => OpPayload::Move {
                block_id: block_id.clone(),
                new_parent_id: new_parent_id.clone(),
                new_prev_id: new_prev_id.clone(),
            },
            ChangeKind::RangeMoved {
                start_id,
                end_id,
                new_parent_id,
                new_prev_id,
                ..
            } => OpPayload::MoveRange {
                range: [start_id.clone(), end_id.clone()],
                new_parent_id: new_parent_id.clone(),
                new_prev_id: new_prev_id.clone(),
            },
            ChangeKind::Removed { block_id, .. } => OpPayload::Remove {
                block_id: block_id.clone(),
            },
        }
    }
}

/// A change notification.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockChange {
    pub origin: ChangeOrigin,
    pub kind: ChangeKind,
}

// ============================================================================
// BlockChain
// ============================================================================

/// The document tree: owns every block of one open document.
#[derive(Debug)]
pub struct BlockChain {
    blocks: HashMap<BlockId, Block>,
    root_id: BlockId,
    origin: ChangeOrigin,
    subscriber: Option<mpsc::UnboundedSender<BlockChange>>,
}

impl BlockChain {
    /// A tree holding only an empty page root.
    pub fn new(root_id: impl Into<BlockId>) -> Self {
        let root_id = root_id.into();
        let root = Block::detached(NewBlock::with_id(root_id.clone(), BlockType::Page, BlockData::new()));
        let mut blocks = HashMap::new();
        blocks.insert(root_id.clone(), root);
        Self {
            blocks,
            root_id,
            origin: ChangeOrigin::Local,
            subscriber: None,
        }
    }

    /// Hydrate live links from a flat snapshot.
    ///
    /// Walks `firstChild`/`next` from the root, deriving `parent` and `prev`.
    /// Records not reachable from the root are dropped.
    pub fn rebuild(data: &DocumentData) -> Result<Self, DocumentError> {
        let root_record = data
            .blocks
            .get(&data.root_id)
            .ok_or_else(|| DocumentError::MissingRoot(data.root_id.clone()))?;
        if root_record.next.is_some() {
            warn!("root {} has a next sibling in snapshot, ignoring it", data.root_id);
        }

        let mut blocks = HashMap::with_capacity(data.blocks.len());
        let mut seen = HashSet::new();
        seen.insert(data.root_id.clone());
        blocks.insert(
            data.root_id.clone(),
            Block {
                id: data.root_id.clone(),
                ty: root_record.ty,
                data: root_record.data.clone(),
                parent: None,
                prev: None,
                next: None,
                first_child: root_record.first_child.clone(),
            },
        );

        let mut work = vec![data.root_id.clone()];
        while let Some(parent_id) = work.pop() {
            let Some(parent_record) = data.blocks.get(&parent_id) else {
                continue;
            };
            let mut prev: Option<BlockId> = None;
            let mut cursor = parent_record.first_child.clone();
            while let Some(id) = cursor {
                let record = data.blocks.get(&id).ok_or_else(|| DocumentError::DanglingReference {
                    from: prev.clone().unwrap_or_else(|| parent_id.clone()),
                    to: id.clone(),
                })?;
                if !seen.insert(id.clone()) {
                    return Err(DocumentError::DuplicateReference(id));
                }
                blocks.insert(
                    id.clone(),
                    Block {
                        id: id.clone(),
                        ty: record.ty,
                        data: record.data.clone(),
                        parent: Some(parent_id.clone()),
                        prev: prev.clone(),
                        next: record.next.clone(),
                        first_child: record.first_child.clone(),
                    },
                );
                work.push(id.clone());
                cursor = record.next.clone();
                prev = Some(id);
            }
        }

        let orphans = data.blocks.len() - blocks.len();
        if orphans > 0 {
            warn!("dropped {} snapshot records unreachable from root {}", orphans, data.root_id);
        }
        debug!("rebuilt document {} with {} blocks", data.root_id, blocks.len());

        Ok(Self {
            blocks,
            root_id: data.root_id.clone(),
            origin: ChangeOrigin::Local,
            subscriber: None,
        })
    }

    /// Flatten back into the hydration format.
    pub fn to_document_data(&self) -> DocumentData {
        let blocks = self
            .blocks
            .iter()
            .map(|(id, b)| {
                (
                    id.clone(),
                    BlockRecord {
                        ty: b.ty,
                        data: b.data.clone(),
                        next: b.next.clone(),
                        first_child: b.first_child.clone(),
                    },
                )
            })
            .collect();
        DocumentData {
            root_id: self.root_id.clone(),
            blocks,
        }
    }

    // ── Subscription ────────────────────────────────────────────────────

    /// Register the change subscriber, replacing any previous one.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<BlockChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriber = Some(tx);
        rx
    }

    pub fn origin(&self) -> ChangeOrigin {
        self.origin
    }

    /// Run `f` with changes tagged as `origin`.
    pub fn with_origin<R>(&mut self, origin: ChangeOrigin, f: impl FnOnce(&mut Self) -> R) -> R {
        let saved = std::mem::replace(&mut self.origin, origin);
        let out = f(self);
        self.origin = saved;
        out
    }

    fn emit(&mut self, kind: ChangeKind) {
        let Some(tx) = &self.subscriber else {
            return;
        };
        let change = BlockChange {
            origin: self.origin,
            kind,
        };
        if tx.send(change).is_err() {
            debug!("change subscriber went away, detaching");
            self.subscriber = None;
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn root_id(&self) -> &BlockId {
        &self.root_id
    }

    pub fn get_block(&self, id: &BlockId) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.blocks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn parent_of(&self, id: &BlockId) -> Option<&BlockId> {
        self.blocks.get(id).and_then(|b| b.parent.as_ref())
    }

    fn child_ids(&self, id: &BlockId) -> Vec<BlockId> {
        self.children(id).into_iter().map(|b| b.id.clone()).collect()
    }

    /// Children in sibling order.
    pub fn children(&self, id: &BlockId) -> Vec<&Block> {
        let mut out = Vec::new();
        let mut cursor = self.blocks.get(id).and_then(|b| b.first_child.as_ref());
        while let Some(child) = cursor.and_then(|c| self.blocks.get(c)) {
            out.push(child);
            if out.len() > self.blocks.len() {
                break;
            }
            cursor = child.next.as_ref();
        }
        out
    }

    pub fn last_child(&self, id: &BlockId) -> Option<&Block> {
        self.children(id).pop()
    }

    fn last_child_id(&self, id: &BlockId) -> Option<BlockId> {
        self.last_child(id).map(|b| b.id.clone())
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: &BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut cursor = self.parent_of(id);
        while let Some(p) = cursor {
            out.push(p.clone());
            if out.len() > self.blocks.len() {
                break;
            }
            cursor = self.parent_of(p);
        }
        out
    }

    /// Whether `ancestor` is a strict ancestor of `of`.
    pub fn is_ancestor(&self, ancestor: &BlockId, of: &BlockId) -> bool {
        self.ancestors(of).iter().any(|a| a == ancestor)
    }

    /// Pre-order walk yielding `(depth, block)`.
    ///
    /// Starts at the root, or at `start` (covering only its subtree). Depth
    /// is relative to the starting block.
    pub fn traverse<'a>(&'a self, start: Option<&'a BlockId>) -> Traverse<'a> {
        let start = start.unwrap_or(&self.root_id);
        Traverse {
            chain: self,
            stack: vec![(0, start)],
        }
    }

    /// Contiguous run `start..=end` following `next`, or None if `end` is not reachable.
    fn sibling_run(&self, start: &BlockId, end: &BlockId) -> Option<Vec<BlockId>> {
        let mut run = vec![start.clone()];
        let mut cursor = start.clone();
        while cursor != *end {
            cursor = self.blocks.get(&cursor)?.next.clone()?;
            run.push(cursor.clone());
        }
        Some(run)
    }

    fn subtree_post_order(&self, id: &BlockId) -> Vec<BlockId> {
        let mut out = Vec::new();
        let mut stack = vec![(id.clone(), false)];
        while let Some((cur, expanded)) = stack.pop() {
            if expanded {
                out.push(cur);
                continue;
            }
            let children = self.child_ids(&cur);
            stack.push((cur, true));
            stack.extend(children.into_iter().rev().map(|c| (c, false)));
        }
        out
    }

    // ── Splicing ────────────────────────────────────────────────────────

    /// Cut `start..=end` out of its sibling list. Links inside the run stay.
    fn unlink_run(&mut self, start: &BlockId, end: &BlockId) {
        let (parent, before) = match self.blocks.get(start) {
            Some(b) => (b.parent.clone(), b.prev.clone()),
            None => return,
        };
        let after = self.blocks.get(end).and_then(|b| b.next.clone());

        match &before {
            Some(b) => {
                if let Some(block) = self.blocks.get_mut(b) {
                    block.next = after.clone();
                }
            }
            None => {
                if let Some(p) = parent.as_ref().and_then(|p| self.blocks.get_mut(p)) {
                    p.first_child = after.clone();
                }
            }
        }
        if let Some(a) = after.as_ref().and_then(|a| self.blocks.get_mut(a)) {
            a.prev = before;
        }
        if let Some(s) = self.blocks.get_mut(start) {
            s.prev = None;
        }
        if let Some(e) = self.blocks.get_mut(end) {
            e.next = None;
        }
    }

    /// Splice a detached run in under `parent` after `prev` (None = first child).
    fn link_run(&mut self, start: &BlockId, end: &BlockId, parent: &BlockId, prev: Option<&BlockId>) {
        let next = match prev {
            Some(p) => self.blocks.get(p).and_then(|b| b.next.clone()),
            None => self.blocks.get(parent).and_then(|b| b.first_child.clone()),
        };
        if let Some(s) = self.blocks.get_mut(start) {
            s.prev = prev.cloned();
        }
        if let Some(e) = self.blocks.get_mut(end) {
            e.next = next.clone();
        }
        if let Some(n) = next.as_ref().and_then(|n| self.blocks.get_mut(n)) {
            n.prev = Some(end.clone());
        }
        match prev {
            Some(p) => {
                if let Some(block) = self.blocks.get_mut(p) {
                    block.next = Some(start.clone());
                }
            }
            None => {
                if let Some(block) = self.blocks.get_mut(parent) {
                    block.first_child = Some(start.clone());
                }
            }
        }
    }

    // ── Mutations ───────────────────────────────────────────────────────

    /// Insert `content` under `parent_id` after `prev_id` (None = first child).
    ///
    /// Rejects a duplicate id, an unknown parent, and a `prev_id` that is not
    /// a child of `parent_id`.
    pub fn insert_block(&mut self, content: NewBlock, parent_id: &BlockId, prev_id: Option<&BlockId>) -> Option<&Block> {
        if self.blocks.contains_key(&content.id) {
            debug!("insert_block: {} already exists", content.id);
            return None;
        }
        if !self.blocks.contains_key(parent_id) {
            debug!("insert_block: unknown parent {}", parent_id);
            return None;
        }
        if let Some(prev) = prev_id
            && self.parent_of(prev) != Some(parent_id)
        {
            debug!("insert_block: {} is not a child of {}", prev, parent_id);
            return None;
        }

        let id = content.id.clone();
        let event = content.clone();
        let mut block = Block::detached(content);
        block.parent = Some(parent_id.clone());
        self.blocks.insert(id.clone(), block);
        self.link_run(&id, &id, parent_id, prev_id);
        trace!("inserted {} under {} after {:?}", id, parent_id, prev_id);

        self.emit(ChangeKind::Inserted {
            block: event,
            parent_id: parent_id.clone(),
            prev_id: prev_id.cloned(),
        });
        self.blocks.get(&id)
    }

    /// Insert `content` as the new first child of `parent_id`.
    pub fn insert_child(&mut self, parent_id: &BlockId, content: NewBlock) -> Option<&Block> {
        self.insert_block(content, parent_id, None)
    }

    /// Insert `content` right after `block_id`.
    pub fn add_sibling(&mut self, block_id: &BlockId, content: NewBlock) -> Option<&Block> {
        let Some(parent) = self.parent_of(block_id).cloned() else {
            debug!("add_sibling: {} is unknown or the root", block_id);
            return None;
        };
        self.insert_block(content, &parent, Some(block_id))
    }

    /// Remove a block and its whole subtree. Returns the removed block.
    pub fn remove(&mut self, block_id: &BlockId) -> Option<Block> {
        if *block_id == self.root_id {
            debug!("remove: refusing to remove root {}", block_id);
            return None;
        }
        let Some(block) = self.blocks.get(block_id) else {
            debug!("remove: unknown block {}", block_id);
            return None;
        };
        let old_parent_id = block.parent.clone()?;
        let old_prev_id = block.prev.clone();

        self.unlink_run(block_id, block_id);
        let removed = self.subtree_post_order(block_id);
        let mut removed_block = None;
        for id in &removed {
            let block = self.blocks.remove(id);
            if id == block_id {
                removed_block = block;
            }
        }
        trace!("removed {} ({} blocks)", block_id, removed.len());

        self.emit(ChangeKind::Removed {
            block_id: block_id.clone(),
            old_parent_id,
            old_prev_id,
            removed,
        });
        removed_block
    }

    /// Re-splice one block (with its subtree) under `new_parent_id` after `new_prev_id`.
    pub fn move_block(
        &mut self,
        block_id: &BlockId,
        new_parent_id: &BlockId,
        new_prev_id: Option<&BlockId>,
    ) -> Option<&Block> {
        let Some(block) = self.blocks.get(block_id) else {
            debug!("move_block: unknown block {}", block_id);
            return None;
        };
        let Some(old_parent_id) = block.parent.clone() else {
            debug!("move_block: refusing to move root {}", block_id);
            return None;
        };
        let old_prev_id = block.prev.clone();

        if !self.blocks.contains_key(new_parent_id) {
            debug!("move_block: unknown parent {}", new_parent_id);
            return None;
        }
        if new_parent_id == block_id || self.is_ancestor(block_id, new_parent_id) {
            debug!("move_block: rejecting cyclic move of {} under {}", block_id, new_parent_id);
            return None;
        }
        if let Some(prev) = new_prev_id
            && (prev == block_id || self.parent_of(prev) != Some(new_parent_id))
        {
            debug!("move_block: {} is not a valid anchor under {}", prev, new_parent_id);
            return None;
        }

        self.unlink_run(block_id, block_id);
        self.link_run(block_id, block_id, new_parent_id, new_prev_id);
        if let Some(b) = self.blocks.get_mut(block_id) {
            b.parent = Some(new_parent_id.clone());
        }
        trace!("moved {} under {} after {:?}", block_id, new_parent_id, new_prev_id);

        self.emit(ChangeKind::Moved {
            block_id: block_id.clone(),
            new_parent_id: new_parent_id.clone(),
            new_prev_id: new_prev_id.cloned(),
            old_parent_id,
            old_prev_id,
        });
        self.blocks.get(block_id)
    }

    /// Move the contiguous sibling run `start_id..=end_id` as a unit.
    ///
    /// Only the boundary links of source and destination change; the run's
    /// internal `next`/`prev` links are untouched.
    pub fn move_bulk(
        &mut self,
        start_id: &BlockId,
        end_id: &BlockId,
        new_parent_id: &BlockId,
        new_prev_id: Option<&BlockId>,
    ) -> Option<[&Block; 2]> {
        let (Some(start_parent), Some(end_parent)) = (self.parent_of(start_id), self.parent_of(end_id)) else {
            debug!("move_bulk: unknown endpoint {}..{}", start_id, end_id);
            return None;
        };
        if start_parent != end_parent {
            debug!("move_bulk: {} and {} have different parents", start_id, end_id);
            return None;
        }
        let old_parent_id = start_parent.clone();
        let Some(run) = self.sibling_run(start_id, end_id) else {
            debug!("move_bulk: {} does not follow {}", end_id, start_id);
            return None;
        };
        if !self.blocks.contains_key(new_parent_id) {
            debug!("move_bulk: unknown parent {}", new_parent_id);
            return None;
        }

        let members: HashSet<&BlockId> = run.iter().collect();
        let mut lineage = self.ancestors(new_parent_id);
        lineage.push(new_parent_id.clone());
        if lineage.iter().any(|a| members.contains(a)) {
            debug!("move_bulk: rejecting cyclic move of {}..{} under {}", start_id, end_id, new_parent_id);
            return None;
        }
        if let Some(prev) = new_prev_id
            && (members.contains(prev) || self.parent_of(prev) != Some(new_parent_id))
        {
            debug!("move_bulk: {} is not a valid anchor under {}", prev, new_parent_id);
            return None;
        }

        let old_prev_id = self.blocks.get(start_id).and_then(|b| b.prev.clone());
        self.unlink_run(start_id, end_id);
        self.link_run(start_id, end_id, new_parent_id, new_prev_id);
        for id in &run {
            if let Some(b) = self.blocks.get_mut(id) {
                b.parent = Some(new_parent_id.clone());
            }
        }
        trace!("moved run {}..{} ({}) under {}", start_id, end_id, run.len(), new_parent_id);

        self.emit(ChangeKind::RangeMoved {
            start_id: start_id.clone(),
            end_id: end_id.clone(),
            new_parent_id: new_parent_id.clone(),
            new_prev_id: new_prev_id.cloned(),
            old_parent_id,
            old_prev_id,
        });
        Some([self.blocks.get(start_id)?, self.blocks.get(end_id)?])
    }

    /// Deep-set `value` at `path` inside the block's payload.
    pub fn update_block<S: AsRef<str>>(&mut self, block_id: &BlockId, path: &[S], value: Value) -> Option<&Block> {
        let Some(block) = self.blocks.get_mut(block_id) else {
            debug!("update_block: unknown block {}", block_id);
            return None;
        };
        if let Err(e) = block.data.set_path(path, value.clone()) {
            warn!("update_block: {} rejected: {}", block_id, e);
            return None;
        }
        self.emit(ChangeKind::Updated {
            block_id: block_id.clone(),
            path: path.iter().map(|s| s.as_ref().to_string()).collect(),
            value,
        });
        self.blocks.get(block_id)
    }

    /// Add `content` after `block_id` and move all of `block_id`'s children under it.
    pub fn split_node(&mut self, block_id: &BlockId, content: NewBlock) -> Option<&Block> {
        if !self.blocks.contains_key(block_id) {
            debug!("split_node: unknown block {}", block_id);
            return None;
        }
        let children = self.child_ids(block_id);
        let new_id = self.add_sibling(block_id, content)?.id.clone();
        if let (Some(first), Some(last)) = (children.first(), children.last()) {
            self.move_bulk(first, last, &new_id, None);
        }
        self.blocks.get(&new_id)
    }

    /// Make the block the last child of its previous sibling.
    pub fn indent(&mut self, block_id: &BlockId) -> Option<&Block> {
        let Some(prev) = self.blocks.get(block_id).and_then(|b| b.prev.clone()) else {
            debug!("indent: {} has no previous sibling", block_id);
            return None;
        };
        if !self.blocks.get(&prev)?.ty.can_have_children() {
            debug!("indent: {} cannot hold children", prev);
            return None;
        }
        let tail = self.last_child_id(&prev);
        self.move_block(block_id, &prev, tail.as_ref())
    }

    /// Move the block after its parent; its following siblings become its
    /// trailing children.
    pub fn outdent(&mut self, block_id: &BlockId) -> Option<&Block> {
        let block = self.blocks.get(block_id)?;
        let parent = block.parent.clone()?;
        let followers = block.next.clone();
        let Some(grandparent) = self.parent_of(&parent).cloned() else {
            debug!("outdent: {} is already top level", block_id);
            return None;
        };
        let last_follower = self.last_child_id(&parent);

        self.move_block(block_id, &grandparent, Some(&parent))?;

        if let (Some(first), Some(last)) = (followers, last_follower)
            && self.blocks.get(block_id).is_some_and(|b| b.ty.can_have_children())
        {
            let tail = self.last_child_id(block_id);
            self.move_bulk(&first, &last, block_id, tail.as_ref());
        }
        self.blocks.get(block_id)
    }

    // ── Validation ──────────────────────────────────────────────────────

    /// Check every structural invariant.
    pub fn validate(&self) -> Result<(), DocumentError> {
        let invariant = |msg: String| Err(DocumentError::Invariant(msg));

        let Some(root) = self.blocks.get(&self.root_id) else {
            return Err(DocumentError::MissingRoot(self.root_id.clone()));
        };
        if root.parent.is_some() || root.prev.is_some() || root.next.is_some() {
            return invariant(format!("root {} has a parent or siblings", self.root_id));
        }

        for (id, b) in &self.blocks {
            if b.id != *id {
                return invariant(format!("block keyed {} carries id {}", id, b.id));
            }
            match (&b.parent, &b.prev) {
                (None, _) if *id != self.root_id => return invariant(format!("{} has no parent", id)),
                (Some(p), None) => {
                    if self.blocks.get(p).and_then(|p| p.first_child.as_ref()) != Some(id) {
                        return invariant(format!("{} has no prev but is not first child of {}", id, p));
                    }
                }
                (Some(p), Some(prev)) => {
                    let Some(prev_block) = self.blocks.get(prev) else {
                        return invariant(format!("{} has unknown prev {}", id, prev));
                    };
                    if prev_block.next.as_ref() != Some(id) || prev_block.parent.as_ref() != Some(p) {
                        return invariant(format!("{}.prev = {} does not link back", id, prev));
                    }
                }
                _ => {}
            }
            if let Some(next) = &b.next {
                let Some(next_block) = self.blocks.get(next) else {
                    return invariant(format!("{} has unknown next {}", id, next));
                };
                if next_block.prev.as_ref() != Some(id) || next_block.parent != b.parent {
                    return invariant(format!("{}.next = {} does not link back", id, next));
                }
            }
            if let Some(child) = &b.first_child {
                let Some(child_block) = self.blocks.get(child) else {
                    return invariant(format!("{} has unknown first child {}", id, child));
                };
                if child_block.parent.as_ref() != Some(id) || child_block.prev.is_some() {
                    return invariant(format!("{}.first_child = {} is not anchored", id, child));
                }
            }
        }

        let mut reached = HashSet::new();
        for (_, block) in self.traverse(None).take(self.blocks.len() + 1) {
            if !reached.insert(&block.id) {
                return invariant(format!("{} reachable twice", block.id));
            }
        }
        if reached.len() != self.blocks.len() {
            return invariant(format!(
                "{} of {} blocks reachable from root",
                reached.len(),
                self.blocks.len()
            ));
        }
        Ok(())
    }
}

/// Pre-order iterator returned by [`BlockChain::traverse`].
pub struct Traverse<'a> {
    chain: &'a BlockChain,
    stack: Vec<(usize, &'a BlockId)>,
}

impl<'a> Iterator for Traverse<'a> {
    type Item = (usize, &'a Block);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, id) = self.stack.pop()?;
        let block = self.chain.blocks.get(id)?;
        let children = self.chain.children(id);
        self.stack
            .extend(children.into_iter().rev().map(|c| (depth + 1, &c.id)));
        Some((depth, block))
    }
}
