//! Document session.
//!
//! [`DocumentController`] owns one open document: the block tree, its sync
//! engine, the region grid and the position observer. Every mutation goes
//! through the controller, which drains the tree's change channel right after
//! so local changes land in the operation log and the spatial index never
//! keeps rectangles for blocks that are gone.

use std::collections::HashMap;
use std::sync::Arc;

use quire_crdt::{Attributes, Delta, TextUpdate};
use quire_types::{BlockData, BlockId, BlockRect, ClientId, DocumentData, NewBlock, Operation, RemoteEvent, SplitRelationship};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::block_chain::{Block, BlockChain, BlockChange, ChangeKind, ChangeOrigin};
use crate::config::DocumentConfig;
use crate::error::{DocumentError, SyncError};
use crate::region_grid::RegionGrid;
use crate::remote::RemoteStore;
use crate::sync::SyncEngine;
use crate::viewport::PositionObserver;

const DELTA_FIELD: &str = "delta";

/// One open document.
pub struct DocumentController<R: RemoteStore> {
    chain: BlockChain,
    changes: UnboundedReceiver<BlockChange>,
    sync: SyncEngine,
    grid: RegionGrid,
    positions: PositionObserver,
    remote: Arc<R>,
    config: DocumentConfig,
}

impl<R: RemoteStore> DocumentController<R> {
    /// Open a document as a fresh client.
    pub fn open(
        doc_id: impl Into<String>,
        data: &DocumentData,
        remote: Arc<R>,
        config: DocumentConfig,
    ) -> Result<Self, DocumentError> {
        Self::open_as(doc_id, ClientId::new(), data, remote, config)
    }

    /// Open a document under a known client id.
    pub fn open_as(
        doc_id: impl Into<String>,
        client: ClientId,
        data: &DocumentData,
        remote: Arc<R>,
        config: DocumentConfig,
    ) -> Result<Self, DocumentError> {
        config.validate()?;
        let mut chain = BlockChain::rebuild(data).inspect_err(|e| error!("corrupt snapshot for {}: {}", data.root_id, e))?;
        let changes = chain.subscribe();
        let sync = SyncEngine::new(doc_id, client, &config);
        info!(
            "opened document {} ({} blocks) as client {}",
            sync.doc_id(),
            chain.len(),
            client
        );
        Ok(Self {
            chain,
            changes,
            sync,
            grid: RegionGrid::new(config.region_size),
            positions: PositionObserver::new(config.position_debounce()),
            remote,
            config,
        })
    }

    /// Push what is still queued and hand back the final snapshot.
    ///
    /// Ops the remote refuses are logged and dropped with the session.
    pub async fn close(mut self) -> DocumentData {
        self.drain_changes();
        while !self.sync.pending_ops().is_empty() {
            match self.sync.flush(self.remote.as_ref()).await {
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "closing {} with {} unsent ops: {}",
                        self.sync.doc_id(),
                        self.sync.pending_ops().len(),
                        e
                    );
                    break;
                }
            }
        }
        info!("closed document {}", self.sync.doc_id());
        self.chain.to_document_data()
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn doc_id(&self) -> &str {
        self.sync.doc_id()
    }

    pub fn client(&self) -> ClientId {
        self.sync.client()
    }

    pub fn config(&self) -> &DocumentConfig {
        &self.config
    }

    pub fn chain(&self) -> &BlockChain {
        &self.chain
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn grid(&self) -> &RegionGrid {
        &self.grid
    }

    pub fn root_id(&self) -> &BlockId {
        self.chain.root_id()
    }

    pub fn get_block(&self, id: &BlockId) -> Option<&Block> {
        self.chain.get_block(id)
    }

    pub fn pending_ops(&self) -> &[Operation] {
        self.sync.pending_ops()
    }

    pub fn to_document_data(&self) -> DocumentData {
        self.chain.to_document_data()
    }

    // ── Tree operations ─────────────────────────────────────────────────

    fn settle(&mut self, id: Option<BlockId>) -> Option<&Block> {
        self.drain_changes();
        let id = id?;
        self.chain.get_block(&id)
    }

    pub fn insert_block(&mut self, content: NewBlock, parent_id: &BlockId, prev_id: Option<&BlockId>) -> Option<&Block> {
        let id = self.chain.insert_block(content, parent_id, prev_id).map(|b| b.id.clone());
        self.settle(id)
    }

    pub fn insert_child(&mut self, parent_id: &BlockId, content: NewBlock) -> Option<&Block> {
        let id = self.chain.insert_child(parent_id, content).map(|b| b.id.clone());
        self.settle(id)
    }

    pub fn add_sibling(&mut self, block_id: &BlockId, content: NewBlock) -> Option<&Block> {
        let id = self.chain.add_sibling(block_id, content).map(|b| b.id.clone());
        self.settle(id)
    }

    pub fn remove(&mut self, block_id: &BlockId) -> Option<Block> {
        let removed = self.chain.remove(block_id);
        self.drain_changes();
        removed
    }

    pub fn move_block(
        &mut self,
        block_id: &BlockId,
        new_parent_id: &BlockId,
        new_prev_id: Option<&BlockId>,
    ) -> Option<&Block> {
        let id = self
            .chain
            .move_block(block_id, new_parent_id, new_prev_id)
            .map(|b| b.id.clone());
        self.settle(id)
    }

    pub fn move_bulk(
        &mut self,
        start_id: &BlockId,
        end_id: &BlockId,
        new_parent_id: &BlockId,
        new_prev_id: Option<&BlockId>,
    ) -> Option<[&Block; 2]> {
        let moved = self
            .chain
            .move_bulk(start_id, end_id, new_parent_id, new_prev_id)
            .is_some();
        self.drain_changes();
        if !moved {
            return None;
        }
        Some([self.chain.get_block(start_id)?, self.chain.get_block(end_id)?])
    }

    /// Deep-set a field of the block's payload.
    ///
    /// Writing a text block's `delta` goes through its text replica as the
    /// smallest edit reaching the new content. Any other write covering
    /// `delta` (the whole payload, or inside the delta) replaces the text
    /// outright and drops the replica.
    pub fn update_block<S: AsRef<str>>(&mut self, block_id: &BlockId, path: &[S], value: Value) -> Option<&Block> {
        let has_text = self.chain.get_block(block_id).is_some_and(|b| b.ty.has_text());
        let touches_text = path.first().is_none_or(|p| p.as_ref() == DELTA_FIELD);
        if has_text && touches_text {
            if let [field] = path
                && field.as_ref() == DELTA_FIELD
            {
                return self.replace_text(block_id, &value);
            }
            self.sync.forget_block(block_id);
        }
        let id = self.chain.update_block(block_id, path, value).map(|b| b.id.clone());
        self.settle(id)
    }

    fn replace_text(&mut self, block_id: &BlockId, value: &Value) -> Option<&Block> {
        let content = match Delta::from_value(value) {
            Ok(content) => content,
            Err(e) => {
                warn!("update_block: unreadable delta for {}: {}", block_id, e);
                return None;
            }
        };
        if let Err(e) = self.sync.replace_local_text(&mut self.chain, block_id, &content) {
            warn!("update_block: text of {} not replaced: {}", block_id, e);
            self.drain_changes();
            return None;
        }
        self.settle(Some(block_id.clone()))
    }

    pub fn split_node(&mut self, block_id: &BlockId, content: NewBlock) -> Option<&Block> {
        let id = self.chain.split_node(block_id, content).map(|b| b.id.clone());
        self.settle(id)
    }

    pub fn indent(&mut self, block_id: &BlockId) -> Option<&Block> {
        let id = self.chain.indent(block_id).map(|b| b.id.clone());
        self.settle(id)
    }

    pub fn outdent(&mut self, block_id: &BlockId) -> Option<&Block> {
        let id = self.chain.outdent(block_id).map(|b| b.id.clone());
        self.settle(id)
    }

    // ── Text editing ────────────────────────────────────────────────────

    fn text_of(&self, block_id: &BlockId) -> Result<Option<Delta>, SyncError> {
        let Some(block) = self.chain.get_block(block_id) else {
            return Ok(None);
        };
        Ok(Some(Delta::from_value(block.data.delta_value().unwrap_or(&Value::Null))?))
    }

    /// Apply a local change delta to a block's text. Returns the merged content.
    pub fn apply_text_delta(&mut self, block_id: &BlockId, delta: &Delta) -> Result<Option<Delta>, SyncError> {
        let merged = self.sync.apply_local_text(&mut self.chain, block_id, delta);
        self.drain_changes();
        merged
    }

    /// Merge a text update from another client.
    pub fn receive_text_update(&mut self, block_id: &BlockId, update: &TextUpdate) -> Result<Option<Delta>, SyncError> {
        let merged = self.sync.receive_text_update(&mut self.chain, block_id, update);
        self.drain_changes();
        merged
    }

    /// Text updates to hand to the CRDT transport.
    pub fn take_text_updates(&mut self) -> Vec<(BlockId, TextUpdate)> {
        self.sync.take_text_updates()
    }

    /// Split a text block at a character offset (enter key).
    ///
    /// The text after `offset` moves into a new block whose type and placement
    /// follow [`BlockType::split_behavior`](quire_types::BlockType::split_behavior).
    /// A new next sibling also takes over the block's children.
    pub fn split_text(&mut self, block_id: &BlockId, offset: usize) -> Result<Option<&Block>, SyncError> {
        let Some(block) = self.chain.get_block(block_id) else {
            debug!("split_text: unknown block {}", block_id);
            return Ok(None);
        };
        if !block.ty.has_text() {
            debug!("split_text: {} ({}) carries no text", block_id, block.ty);
            return Ok(None);
        }
        let behavior = block.ty.split_behavior();
        if behavior.relationship == SplitRelationship::NextSibling && block.parent.is_none() {
            return Ok(None);
        }

        let content = self.text_of(block_id)?.unwrap_or_default();
        let len = content.len();
        let offset = offset.min(len);
        let tail = content.slice(offset, len);

        if offset < len {
            let cut = Delta::new().retain(offset, Attributes::new()).delete(len - offset);
            self.sync.apply_local_text(&mut self.chain, block_id, &cut)?;
        }

        let new_block = NewBlock::new(behavior.next_type, BlockData::with_delta(tail.to_value()));
        let id = match behavior.relationship {
            SplitRelationship::NextSibling => self.chain.split_node(block_id, new_block),
            SplitRelationship::FirstChild => self.chain.insert_child(block_id, new_block),
        }
        .map(|b| b.id.clone());
        Ok(self.settle(id))
    }

    /// Merge a block into the text block before it in document order
    /// (backspace at offset zero). Returns the block merged into.
    pub fn merge_into_previous(&mut self, block_id: &BlockId) -> Result<Option<&Block>, SyncError> {
        let Some(block) = self.chain.get_block(block_id) else {
            debug!("merge_into_previous: unknown block {}", block_id);
            return Ok(None);
        };
        if !block.ty.has_text() || block.parent.is_none() {
            return Ok(None);
        }
        let parent = block.parent.clone();

        let root = self.chain.root_id().clone();
        let Some(target) = self
            .chain
            .traverse(None)
            .map(|(_, b)| b)
            .take_while(|b| b.id != *block_id)
            .filter(|b| b.id != root && b.ty.has_text())
            .last()
            .map(|b| b.id.clone())
        else {
            debug!("merge_into_previous: nothing before {}", block_id);
            return Ok(None);
        };

        let source = self.text_of(block_id)?.unwrap_or_default();
        let target_len = self.text_of(&target)?.map_or(0, |d| d.len());
        if !source.is_empty() {
            let append = Delta::new().retain(target_len, Attributes::new()).concat(&source);
            self.sync.apply_local_text(&mut self.chain, &target, &append)?;
        }

        let children: Vec<BlockId> = self.chain.children(block_id).iter().map(|b| b.id.clone()).collect();
        if let (Some(first), Some(last)) = (children.first(), children.last()) {
            let adopt_into_target = self.chain.get_block(&target).is_some_and(|b| b.ty.can_have_children());
            if adopt_into_target && parent.as_ref() == Some(&target) {
                self.chain.move_bulk(first, last, &target, Some(block_id));
            } else if adopt_into_target {
                let tail = self.chain.last_child(&target).map(|b| b.id.clone());
                self.chain.move_bulk(first, last, &target, tail.as_ref());
            } else if let Some(parent) = &parent {
                self.chain.move_bulk(first, last, parent, Some(block_id));
            }
        }

        self.chain.remove(block_id);
        Ok(self.settle(Some(target)))
    }

    /// Delete the text from `start_offset` in `start_id` to `end_offset` in
    /// `end_id` (a selection). Returns the block the selection collapses into.
    ///
    /// The end block's remaining text is appended to the start block, blocks
    /// between the two in document order are removed, and the end block goes
    /// too. Children of removed blocks that lie outside the selection are
    /// lifted into the removed block's place.
    pub fn delete_range(
        &mut self,
        start_id: &BlockId,
        start_offset: usize,
        end_id: &BlockId,
        end_offset: usize,
    ) -> Result<Option<&Block>, SyncError> {
        for id in [start_id, end_id] {
            let Some(block) = self.chain.get_block(id) else {
                debug!("delete_range: unknown block {}", id);
                return Ok(None);
            };
            if !block.ty.has_text() || block.parent.is_none() {
                return Ok(None);
            }
        }

        if start_id == end_id {
            let len = self.text_of(start_id)?.map_or(0, |d| d.len());
            let from = start_offset.min(end_offset).min(len);
            let to = start_offset.max(end_offset).min(len);
            if to > from {
                let cut = Delta::new().retain(from, Attributes::new()).delete(to - from);
                self.sync.apply_local_text(&mut self.chain, start_id, &cut)?;
            }
            return Ok(self.settle(Some(start_id.clone())));
        }

        let order: Vec<BlockId> = self.chain.traverse(None).map(|(_, b)| b.id.clone()).collect();
        let (Some(first), Some(last)) = (
            order.iter().position(|id| id == start_id),
            order.iter().position(|id| id == end_id),
        ) else {
            return Ok(None);
        };
        if last < first {
            debug!("delete_range: {} comes after {}", start_id, end_id);
            return Ok(None);
        }
        let between = &order[first + 1..last];
        let end_ancestors = self.chain.ancestors(end_id);

        let head = self.text_of(start_id)?.unwrap_or_default();
        let tail = self.text_of(end_id)?.unwrap_or_default();
        let keep = start_offset.min(head.len());
        let change = Delta::new()
            .retain(keep, Attributes::new())
            .delete(head.len() - keep)
            .concat(&tail.slice(end_offset.min(tail.len()), tail.len()));
        self.sync.apply_local_text(&mut self.chain, start_id, &change)?;

        self.lift_children(end_id);
        self.chain.remove(end_id);
        for id in between.iter().filter(|id| !end_ancestors.contains(id)) {
            self.chain.remove(id);
        }
        for id in end_ancestors.iter().filter(|id| between.contains(id)) {
            self.lift_children(id);
            self.chain.remove(id);
        }
        Ok(self.settle(Some(start_id.clone())))
    }

    /// [`delete_range`](Self::delete_range), then split where the selection
    /// began (enter over a selection). Returns the new block.
    pub fn delete_range_and_split(
        &mut self,
        start_id: &BlockId,
        start_offset: usize,
        end_id: &BlockId,
        end_offset: usize,
    ) -> Result<Option<&Block>, SyncError> {
        if self
            .delete_range(start_id, start_offset, end_id, end_offset)?
            .is_none()
        {
            return Ok(None);
        }
        let caret = if start_id == end_id {
            start_offset.min(end_offset)
        } else {
            start_offset
        };
        self.split_text(start_id, caret)
    }

    /// Move a block's children up into its place, right after it.
    fn lift_children(&mut self, block_id: &BlockId) {
        let Some(parent) = self.chain.get_block(block_id).and_then(|b| b.parent.clone()) else {
            return;
        };
        let children: Vec<BlockId> = self.chain.children(block_id).iter().map(|b| b.id.clone()).collect();
        if let (Some(first), Some(last)) = (children.first(), children.last()) {
            self.chain.move_bulk(first, last, &parent, Some(block_id));
        }
    }

    /// Deep-copy a block and its descendants under fresh ids, right after the
    /// original. Returns the copy.
    pub fn duplicate(&mut self, block_id: &BlockId) -> Option<&Block> {
        let Some(parent) = self.chain.get_block(block_id).and_then(|b| b.parent.clone()) else {
            debug!("duplicate: {} is unknown or the root", block_id);
            return None;
        };
        let nodes: Vec<(NewBlock, Option<BlockId>)> = self
            .chain
            .traverse(Some(block_id))
            .map(|(_, b)| (b.content(), b.parent.clone()))
            .collect();

        let mut fresh: HashMap<BlockId, BlockId> = HashMap::new();
        let mut copy_id = None;
        for (NewBlock { id, ty, data }, old_parent) in nodes {
            let copy = NewBlock::new(ty, data);
            let new_id = copy.id.clone();
            let inserted = if copy_id.is_none() {
                self.chain.insert_block(copy, &parent, Some(block_id)).is_some()
            } else {
                let Some(new_parent) = old_parent.and_then(|p| fresh.get(&p).cloned()) else {
                    continue;
                };
                let prev = self.chain.last_child(&new_parent).map(|b| b.id.clone());
                self.chain.insert_block(copy, &new_parent, prev.as_ref()).is_some()
            };
            if !inserted {
                break;
            }
            if copy_id.is_none() {
                copy_id = Some(new_id.clone());
            }
            fresh.insert(id, new_id);
        }
        debug!("duplicated {} blocks under {}", fresh.len(), block_id);
        self.settle(copy_id)
    }

    // ── Remote input ────────────────────────────────────────────────────

    pub fn receive_ops(&mut self, ops: Vec<Operation>) -> usize {
        let applied = self.sync.receive_ops(&mut self.chain, ops);
        self.drain_changes();
        applied
    }

    pub fn handle_remote_event(&mut self, event: &RemoteEvent) -> bool {
        let applied = self.sync.fold_remote_event(&mut self.chain, event);
        self.drain_changes();
        applied
    }

    // ── Flushing ────────────────────────────────────────────────────────

    pub async fn flush(&mut self) -> Result<usize, SyncError> {
        self.sync.flush(self.remote.as_ref()).await
    }

    pub async fn flush_due(&mut self) -> Result<usize, SyncError> {
        self.sync.flush_due(self.remote.as_ref()).await
    }

    pub async fn wait_and_flush(&mut self) -> Result<usize, SyncError> {
        self.sync.wait_and_flush(self.remote.as_ref()).await
    }

    // ── Viewport ────────────────────────────────────────────────────────

    pub fn get_intersect_blocks(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<&BlockRect> {
        self.grid.get_intersect_blocks(x0, y0, x1, y1)
    }

    /// Start visibility tracking for a block.
    pub fn observe_block(&mut self, block_id: &BlockId) -> bool {
        if !self.chain.contains(block_id) {
            return false;
        }
        self.positions.observe(block_id.clone());
        true
    }

    /// Stop tracking a block. Its last committed rectangle stays in the grid.
    pub fn unobserve_block(&mut self, block_id: &BlockId) -> bool {
        self.positions.unobserve(block_id)
    }

    pub fn set_block_visible(&mut self, block_id: &BlockId, visible: bool) -> bool {
        self.positions.set_visible(block_id, visible)
    }

    pub fn report_block_rect(&mut self, rect: BlockRect) -> bool {
        if !self.chain.contains(&rect.id) {
            return false;
        }
        self.positions.report_rect(rect, Instant::now())
    }

    /// Commit measurements whose debounce window has passed.
    pub fn commit_positions(&mut self) -> usize {
        self.positions.flush_due(&mut self.grid, Instant::now())
    }

    /// Commit every pending measurement now.
    pub fn commit_all_positions(&mut self) -> usize {
        self.positions.flush_all(&mut self.grid)
    }

    // ── Change routing ──────────────────────────────────────────────────

    fn drain_changes(&mut self) {
        let mut outgoing = Vec::new();
        while let Ok(change) = self.changes.try_recv() {
            match &change.kind {
                ChangeKind::Removed { removed, .. } => {
                    for id in removed {
                        self.grid.remove_block(id);
                        self.positions.unobserve(id);
                        self.sync.forget_block(id);
                    }
                }
                ChangeKind::Moved { block_id, .. } => self.invalidate_subtree(block_id),
                ChangeKind::RangeMoved { start_id, end_id, .. } => {
                    let mut cursor = Some(start_id.clone());
                    while let Some(id) = cursor {
                        self.invalidate_subtree(&id);
                        if id == *end_id {
                            break;
                        }
                        cursor = self.chain.get_block(&id).and_then(|b| b.next.clone());
                    }
                }
                ChangeKind::Inserted { .. } | ChangeKind::Updated { .. } => {}
            }
            if change.origin == ChangeOrigin::Local {
                outgoing.push(change.kind.to_payload());
            }
        }
        if !outgoing.is_empty() {
            self.sync.send_ops(outgoing);
        }
    }

    fn invalidate_subtree(&mut self, block_id: &BlockId) {
        for (_, block) in self.chain.traverse(Some(block_id)) {
            self.positions.invalidate(&block.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;
    use quire_types::{BlockType, OpPayload};
    use serde_json::json;

    fn id(s: &str) -> BlockId {
        BlockId::from(s)
    }

    fn text(name: &str, ty: BlockType, content: &str) -> NewBlock {
        NewBlock::with_id(name, ty, BlockData::with_delta(json!([{ "insert": content }])))
    }

    fn open() -> DocumentController<MemoryRemote> {
        let data = DocumentData::empty_page("root");
        DocumentController::open_as("doc", ClientId(1), &data, Arc::new(MemoryRemote::new()), DocumentConfig::default())
            .unwrap()
    }

    fn content(doc: &DocumentController<MemoryRemote>, block: &str) -> String {
        doc.text_of(&id(block)).unwrap().unwrap().to_text()
    }

    fn child_ids(doc: &DocumentController<MemoryRemote>, parent: &str) -> Vec<String> {
        doc.chain().children(&id(parent)).iter().map(|b| b.id.to_string()).collect()
    }

    #[test]
    fn test_mutations_become_ops() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "a")).unwrap();
        doc.add_sibling(&id("A"), text("B", BlockType::Text, "b")).unwrap();
        doc.update_block(&id("B"), &["checked"], json!(true)).unwrap();
        doc.remove(&id("A")).unwrap();

        let kinds: Vec<&str> = doc.pending_ops().iter().map(|o| o.payload.kind()).collect();
        assert_eq!(kinds, ["insert", "insert", "update", "remove"]);
        assert!(doc.remove(&id("A")).is_none());
        assert_eq!(doc.pending_ops().len(), 4);
    }

    #[test]
    fn test_removed_blocks_leave_grid() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::ToggleList, "a")).unwrap();
        doc.insert_child(&id("A"), text("A1", BlockType::Text, "")).unwrap();
        for block in ["A", "A1"] {
            assert!(doc.observe_block(&id(block)));
            doc.set_block_visible(&id(block), true);
        }
        doc.report_block_rect(BlockRect::new("A", 0.0, 0.0, 100.0, 20.0));
        doc.report_block_rect(BlockRect::new("A1", 0.0, 20.0, 100.0, 20.0));
        assert_eq!(doc.commit_all_positions(), 2);

        doc.remove(&id("A"));
        assert!(doc.grid().is_empty());
        assert!(doc.get_intersect_blocks(0.0, 0.0, 500.0, 500.0).is_empty());
        assert!(!doc.report_block_rect(BlockRect::new("A1", 0.0, 0.0, 1.0, 1.0)));
    }

    #[test]
    fn test_move_drops_pending_measurements() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "a")).unwrap();
        doc.add_sibling(&id("A"), text("B", BlockType::Text, "b")).unwrap();
        doc.insert_child(&id("B"), text("B1", BlockType::Text, "")).unwrap();
        doc.observe_block(&id("B1"));
        doc.set_block_visible(&id("B1"), true);
        doc.report_block_rect(BlockRect::new("B1", 0.0, 40.0, 100.0, 20.0));

        doc.move_block(&id("B"), &id("root"), None).unwrap();
        assert_eq!(doc.commit_all_positions(), 0);
    }

    #[test]
    fn test_split_text_at_offset() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "hello world")).unwrap();
        doc.insert_child(&id("A"), text("A1", BlockType::Text, "child")).unwrap();

        let new_id = doc.split_text(&id("A"), 5).unwrap().unwrap().id.clone();
        assert_eq!(content(&doc, "A"), "hello");
        assert_eq!(content(&doc, new_id.as_str()), " world");
        assert_eq!(child_ids(&doc, "root"), ["A", new_id.as_str()]);
        assert_eq!(child_ids(&doc, new_id.as_str()), ["A1"]);
        doc.chain().validate().unwrap();
    }

    #[test]
    fn test_split_list_item_keeps_type() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("L", BlockType::BulletedList, "ab")).unwrap();
        let new_block = doc.split_text(&id("L"), 99).unwrap().unwrap();
        assert_eq!(new_block.ty, BlockType::BulletedList);
        assert_eq!(content(&doc, "L"), "ab");
    }

    #[test]
    fn test_split_toggle_opens_first_child() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("T", BlockType::ToggleList, "head")).unwrap();
        doc.insert_child(&id("T"), text("T1", BlockType::Text, "x")).unwrap();
        let new_id = doc.split_text(&id("T"), 4).unwrap().unwrap().id.clone();
        assert_eq!(child_ids(&doc, "T"), [new_id.as_str(), "T1"]);
    }

    #[test]
    fn test_merge_into_previous_sibling() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "foo")).unwrap();
        doc.add_sibling(&id("A"), text("B", BlockType::Text, "bar")).unwrap();
        doc.insert_child(&id("B"), text("B1", BlockType::Text, "")).unwrap();

        let target = doc.merge_into_previous(&id("B")).unwrap().unwrap().id.clone();
        assert_eq!(target, id("A"));
        assert_eq!(content(&doc, "A"), "foobar");
        assert!(doc.get_block(&id("B")).is_none());
        assert_eq!(child_ids(&doc, "A"), ["B1"]);
        doc.chain().validate().unwrap();
    }

    #[test]
    fn test_merge_first_child_into_parent_keeps_order() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("P", BlockType::ToggleList, "p")).unwrap();
        doc.insert_child(&id("P"), text("C", BlockType::Text, "c")).unwrap();
        doc.add_sibling(&id("C"), text("D", BlockType::Text, "d")).unwrap();
        doc.insert_child(&id("C"), text("C1", BlockType::Text, "")).unwrap();

        doc.merge_into_previous(&id("C")).unwrap().unwrap();
        assert_eq!(content(&doc, "P"), "pc");
        assert_eq!(child_ids(&doc, "P"), ["C1", "D"]);
    }

    #[test]
    fn test_merge_with_nothing_before_is_noop() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "a")).unwrap();
        let before = doc.pending_ops().len();
        assert!(doc.merge_into_previous(&id("A")).unwrap().is_none());
        assert!(doc.merge_into_previous(&id("root")).unwrap().is_none());
        assert_eq!(doc.pending_ops().len(), before);
    }

    #[test]
    fn test_delta_write_edits_the_live_replica() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "hello")).unwrap();
        doc.apply_text_delta(&id("A"), &Delta::new().retain(5, Attributes::new()).insert_plain("!"))
            .unwrap();

        doc.update_block(&id("A"), &["delta"], json!([{"insert": "HELLO"}])).unwrap();
        assert_eq!(content(&doc, "A"), "HELLO");
        assert_eq!(doc.sync().text_replica(&id("A")).unwrap().to_text(), "HELLO");
        assert!(matches!(
            &doc.pending_ops().last().unwrap().payload,
            OpPayload::Update { merged: true, .. }
        ));

        doc.apply_text_delta(&id("A"), &Delta::new().retain(5, Attributes::new()).insert_plain(" there"))
            .unwrap();
        assert_eq!(content(&doc, "A"), "HELLO there");
        let tail = doc.split_text(&id("A"), 5).unwrap().unwrap().id.clone();
        assert_eq!(content(&doc, "A"), "HELLO");
        assert_eq!(content(&doc, tail.as_str()), " there");

        assert!(doc.update_block(&id("A"), &["delta"], json!("not a delta")).is_none());
        assert_eq!(content(&doc, "A"), "HELLO");
    }

    #[test]
    fn test_whole_payload_write_drops_replica() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("H", BlockType::Heading, "old")).unwrap();
        doc.apply_text_delta(&id("H"), &Delta::new().insert_plain(">")).unwrap();

        let empty: [&str; 0] = [];
        doc.update_block(&id("H"), &empty, json!({"level": 2, "delta": [{"insert": "new"}]}))
            .unwrap();
        assert!(doc.sync().text_replica(&id("H")).is_none());
        assert_eq!(content(&doc, "H"), "new");

        doc.apply_text_delta(&id("H"), &Delta::new().retain(3, Attributes::new()).insert_plain("!"))
            .unwrap();
        assert_eq!(content(&doc, "H"), "new!");
    }

    #[test]
    fn test_delete_range_across_blocks() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "hello")).unwrap();
        doc.add_sibling(&id("A"), text("B", BlockType::Text, "middle")).unwrap();
        doc.insert_child(&id("B"), text("B1", BlockType::Text, "deep")).unwrap();
        doc.add_sibling(&id("B"), text("C", BlockType::Text, "world")).unwrap();
        doc.insert_child(&id("C"), text("C1", BlockType::Text, "kid")).unwrap();

        let kept = doc.delete_range(&id("A"), 2, &id("C"), 3).unwrap().unwrap().id.clone();
        assert_eq!(kept, id("A"));
        assert_eq!(content(&doc, "A"), "held");
        for gone in ["B", "B1", "C"] {
            assert!(doc.get_block(&id(gone)).is_none());
        }
        assert_eq!(child_ids(&doc, "root"), ["A", "C1"]);
        doc.chain().validate().unwrap();
    }

    #[test]
    fn test_delete_range_into_nested_end_lifts_the_rest() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "abc")).unwrap();
        doc.add_sibling(&id("A"), text("P", BlockType::ToggleList, "toggle")).unwrap();
        doc.insert_child(&id("P"), text("E", BlockType::Text, "efg")).unwrap();
        doc.add_sibling(&id("E"), text("F", BlockType::Text, "after")).unwrap();

        doc.delete_range(&id("A"), 1, &id("E"), 2).unwrap().unwrap();
        assert_eq!(content(&doc, "A"), "ag");
        assert_eq!(child_ids(&doc, "root"), ["A", "F"]);
        assert_eq!(content(&doc, "F"), "after");
        doc.chain().validate().unwrap();
    }

    #[test]
    fn test_delete_range_within_one_block_and_bad_ranges() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "abcdef")).unwrap();
        doc.add_sibling(&id("A"), text("B", BlockType::Text, "xyz")).unwrap();

        doc.delete_range(&id("A"), 4, &id("A"), 1).unwrap().unwrap();
        assert_eq!(content(&doc, "A"), "aef");

        let before = doc.to_document_data();
        assert!(doc.delete_range(&id("B"), 0, &id("A"), 1).unwrap().is_none());
        assert!(doc.delete_range(&id("A"), 0, &id("zz"), 1).unwrap().is_none());
        assert_eq!(doc.to_document_data(), before);
    }

    #[test]
    fn test_delete_range_and_split() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "hello")).unwrap();
        doc.add_sibling(&id("A"), text("B", BlockType::Text, "world")).unwrap();

        let new_id = doc.delete_range_and_split(&id("A"), 2, &id("B"), 1).unwrap().unwrap().id.clone();
        assert_eq!(content(&doc, "A"), "he");
        assert_eq!(content(&doc, new_id.as_str()), "orld");
        assert_eq!(child_ids(&doc, "root"), ["A", new_id.as_str()]);
    }

    #[test]
    fn test_duplicate_copies_subtree_with_fresh_ids() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::ToggleList, "a")).unwrap();
        doc.insert_child(&id("A"), text("A1", BlockType::Text, "x")).unwrap();
        doc.add_sibling(&id("A1"), text("A2", BlockType::Text, "y")).unwrap();
        doc.insert_child(&id("A2"), text("A21", BlockType::Text, "z")).unwrap();
        doc.add_sibling(&id("A"), text("B", BlockType::Text, "b")).unwrap();
        let before = doc.pending_ops().len();

        let copy = doc.duplicate(&id("A")).unwrap();
        assert_ne!(copy.id, id("A"));
        assert_eq!(copy.ty, BlockType::ToggleList);
        let copy_id = copy.id.clone();

        assert_eq!(child_ids(&doc, "root"), ["A", copy_id.as_str(), "B"]);
        let copied: Vec<(usize, String)> = doc
            .chain()
            .traverse(Some(&copy_id))
            .map(|(depth, b)| (depth, content(&doc, b.id.as_str())))
            .collect();
        assert_eq!(
            copied,
            [
                (0, "a".to_string()),
                (1, "x".to_string()),
                (1, "y".to_string()),
                (2, "z".to_string()),
            ]
        );
        let originals = ["A", "A1", "A2", "A21"];
        assert!(doc.chain().traverse(Some(&copy_id)).all(|(_, b)| !originals.contains(&b.id.as_str())));
        assert_eq!(doc.pending_ops().len(), before + 4);
        assert_eq!(child_ids(&doc, "A"), ["A1", "A2"]);

        assert!(doc.duplicate(&id("root")).is_none());
        assert!(doc.duplicate(&id("zz")).is_none());
        doc.chain().validate().unwrap();
    }

    #[test]
    fn test_remote_ops_do_not_echo() {
        let mut doc = open();
        let op = Operation::new(
            1,
            ClientId(2),
            OpPayload::Insert {
                block: text("R", BlockType::Text, "remote"),
                parent_id: id("root"),
                prev_id: None,
            },
        );
        assert_eq!(doc.receive_ops(vec![op]), 1);
        assert!(doc.get_block(&id("R")).is_some());
        assert!(doc.pending_ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_positions_commit_after_debounce() {
        let mut doc = open();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "a")).unwrap();
        doc.observe_block(&id("A"));
        doc.set_block_visible(&id("A"), true);
        doc.report_block_rect(BlockRect::new("A", 0.0, 0.0, 100.0, 20.0));

        assert_eq!(doc.commit_positions(), 0);
        tokio::time::advance(doc.config().position_debounce()).await;
        assert_eq!(doc.commit_positions(), 1);
        assert_eq!(doc.get_intersect_blocks(0.0, 0.0, 10.0, 10.0).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_and_returns_snapshot() {
        let remote = Arc::new(MemoryRemote::new());
        let data = DocumentData::empty_page("root");
        let mut doc =
            DocumentController::open_as("doc", ClientId(1), &data, remote.clone(), DocumentConfig::default()).unwrap();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "a")).unwrap();
        doc.apply_text_delta(&id("A"), &Delta::new().retain(1, Attributes::new()).insert_plain("b"))
            .unwrap();

        let snapshot = doc.close().await;
        assert_eq!(snapshot.blocks.len(), 2);
        assert_eq!(remote.ops("doc").len(), 2);
    }

    #[tokio::test]
    async fn test_close_while_offline_still_returns_snapshot() {
        let remote = Arc::new(MemoryRemote::new());
        remote.set_offline(true);
        let data = DocumentData::empty_page("root");
        let mut doc =
            DocumentController::open_as("doc", ClientId(1), &data, remote.clone(), DocumentConfig::default()).unwrap();
        doc.insert_child(&id("root"), text("A", BlockType::Text, "a")).unwrap();
        assert!(doc.flush().await.is_err());

        let snapshot = doc.close().await;
        assert!(snapshot.blocks.contains_key(&id("A")));
        assert!(remote.ops("doc").is_empty());
    }

    #[test]
    fn test_open_rejects_bad_config() {
        let data = DocumentData::empty_page("root");
        let config = DocumentConfig {
            region_size: 0.0,
            ..DocumentConfig::default()
        };
        let result = DocumentController::open("doc", &data, Arc::new(MemoryRemote::new()), config);
        assert!(matches!(result, Err(DocumentError::Config(_))));
    }
}
