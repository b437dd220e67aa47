//! Operation log and sync engine.
//!
//! Local tree changes become versioned [`Operation`]s queued in
//! `pending_ops` and pushed to the [`RemoteStore`] in enqueue order. Remote
//! operations are sorted by `(version, client)` and replayed into the
//! [`BlockChain`] as `Remote` changes, so they never re-enter the outgoing log.
//!
//! # Flush scheduling
//!
//! | Op kind    | Flush deadline                    |
//! |------------|-----------------------------------|
//! | structural | immediately                       |
//! | `update`   | `now + text_flush_debounce`       |
//!
//! A scheduled deadline only ever moves earlier. A queued `update` to the
//! same block and path is replaced by the newer one. A failed flush keeps
//! everything queued for the next attempt.
//!
//! # Text
//!
//! Text content goes through one [`SequenceText`] per edited block. The merged
//! document delta is written back into the block's `delta` field as a
//! `Replica` change and logged as an `update` tagged `merged`.
//!
//! | Remote `delta` write | Live replica      | No replica                        |
//! |----------------------|-------------------|-----------------------------------|
//! | `merged`             | ignored           | applied, old content kept as base |
//! | untagged             | replica discarded | applied                           |
//!
//! A base seeds the replica when the matching text update arrives. Local
//! edits always seed from the content currently in the tree.
//!
//! # Structural conflicts
//!
//! Last applied wins. Within a received batch, ops with the same version are
//! ordered by client id, so the higher client id wins a tie.

use std::collections::HashMap;
use std::time::Duration;

use quire_crdt::{Delta, SequenceText, TextCrdt, TextUpdate};
use quire_types::{BlockData, BlockId, BlockType, ClientId, NewBlock, OpPayload, Operation, RemoteCommand, RemoteEvent};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::block_chain::{BlockChain, ChangeOrigin};
use crate::config::DocumentConfig;
use crate::error::SyncError;
use crate::remote::RemoteStore;

/// Field holding a text block's rich-text content.
const DELTA_FIELD: &str = "delta";

/// Row shape of an `Inserted` block-table event.
#[derive(Debug, Deserialize)]
struct BlockRow {
    #[serde(rename = "type")]
    ty: BlockType,
    #[serde(alias = "parentId")]
    parent: BlockId,
    #[serde(default)]
    data: BlockData,
    #[serde(default, alias = "prevId")]
    prev: Option<BlockId>,
}

/// Per-document operation log and text replicas.
#[derive(Debug)]
pub struct SyncEngine {
    doc_id: String,
    client: ClientId,
    /// Last version stamped or seen.
    version: u64,
    pending_ops: Vec<Operation>,
    deadline: Option<Instant>,
    text_debounce: Duration,
    max_batch: usize,
    texts: HashMap<BlockId, SequenceText>,
    /// Text content a block had before a merged remote write replaced it,
    /// used to seed its replica for the text update that follows.
    bases: HashMap<BlockId, Delta>,
    outgoing_text: Vec<(BlockId, TextUpdate)>,
}

impl SyncEngine {
    pub fn new(doc_id: impl Into<String>, client: ClientId, config: &DocumentConfig) -> Self {
        Self {
            doc_id: doc_id.into(),
            client,
            version: 0,
            pending_ops: Vec::new(),
            deadline: None,
            text_debounce: config.text_flush_debounce(),
            max_batch: config.max_flush_batch.max(1),
            texts: HashMap::new(),
            bases: HashMap::new(),
            outgoing_text: Vec::new(),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Operations not yet accepted by the remote store, in enqueue order.
    pub fn pending_ops(&self) -> &[Operation] {
        &self.pending_ops
    }

    /// When the next flush is due, if anything is queued.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    // ── Outgoing ────────────────────────────────────────────────────────

    /// Stamp payloads with fresh versions and queue them.
    pub fn send_ops(&mut self, payloads: Vec<OpPayload>) -> Vec<Operation> {
        let now = Instant::now();
        let mut stamped = Vec::with_capacity(payloads.len());

        for payload in payloads {
            self.version += 1;
            let structural = payload.is_structural();

            if let OpPayload::Update { block_id, path, .. } = &payload
                && let Some(pos) = self.pending_ops.iter().rposition(|op| {
                    matches!(&op.payload, OpPayload::Update { block_id: b, path: p, .. } if b == block_id && p == path)
                })
            {
                let replaced = self.pending_ops.remove(pos);
                trace!("coalesced v{} into v{} for {}", replaced.version, self.version, block_id);
            }

            let op = Operation::new(self.version, self.client, payload);
            self.pending_ops.push(op.clone());
            stamped.push(op);

            let due = if structural { now } else { now + self.text_debounce };
            self.deadline = Some(self.deadline.map_or(due, |d| d.min(due)));
        }
        stamped
    }

    /// Push up to one batch. On failure the ops stay queued.
    pub async fn flush<R: RemoteStore + ?Sized>(&mut self, remote: &R) -> Result<usize, SyncError> {
        if self.pending_ops.is_empty() {
            self.deadline = None;
            return Ok(0);
        }
        let n = self.pending_ops.len().min(self.max_batch);
        match remote.push_ops(&self.doc_id, &self.pending_ops[..n]).await {
            Ok(()) => {
                self.pending_ops.drain(..n);
                self.deadline = if self.pending_ops.is_empty() {
                    None
                } else {
                    Some(Instant::now())
                };
                debug!(
                    "flushed {} ops for {} ({} still pending)",
                    n,
                    self.doc_id,
                    self.pending_ops.len()
                );
                Ok(n)
            }
            Err(e) => {
                warn!(
                    "flush of {} ops for {} failed, keeping {} queued: {}",
                    n,
                    self.doc_id,
                    self.pending_ops.len(),
                    e
                );
                Err(e.into())
            }
        }
    }

    /// Flush only if the deadline has passed.
    pub async fn flush_due<R: RemoteStore + ?Sized>(&mut self, remote: &R) -> Result<usize, SyncError> {
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => self.flush(remote).await,
            _ => Ok(0),
        }
    }

    /// Sleep until the deadline, then flush.
    pub async fn wait_and_flush<R: RemoteStore + ?Sized>(&mut self, remote: &R) -> Result<usize, SyncError> {
        let Some(deadline) = self.deadline else {
            return Ok(0);
        };
        tokio::time::sleep_until(deadline).await;
        self.flush(remote).await
    }

    // ── Incoming ────────────────────────────────────────────────────────

    /// Order a received batch for replay: `(version, client)`, duplicates dropped.
    pub fn resolve_conflict(ops: &mut Vec<Operation>) {
        ops.sort_by_key(Operation::order_key);
        ops.dedup_by_key(|op| op.order_key());
    }

    /// Replay remote operations. Returns how many changed the tree.
    pub fn receive_ops(&mut self, chain: &mut BlockChain, mut ops: Vec<Operation>) -> usize {
        ops.retain(|op| op.client != self.client);
        if ops.is_empty() {
            return 0;
        }
        Self::resolve_conflict(&mut ops);
        let highest = ops.iter().map(|op| op.version).max().unwrap_or(0);

        let mut applied = 0;
        chain.with_origin(ChangeOrigin::Remote, |chain| {
            for op in &ops {
                if self.apply_op(chain, &op.payload) {
                    applied += 1;
                } else {
                    trace!("remote v{} {} from {} was a no-op", op.version, op.payload.kind(), op.client);
                }
            }
        });
        self.version = self.version.max(highest);
        debug!("replayed {}/{} remote ops for {}", applied, ops.len(), self.doc_id);
        applied
    }

    /// Apply one payload to the tree. Returns whether anything changed.
    pub fn apply_op(&mut self, chain: &mut BlockChain, payload: &OpPayload) -> bool {
        match payload {
            OpPayload::Insert {
                block,
                parent_id,
                prev_id,
            } => {
                if chain.contains(&block.id) {
                    return false;
                }
                chain.insert_block(block.clone(), parent_id, prev_id.as_ref()).is_some()
            }
            OpPayload::Update {
                block_id,
                path,
                value,
                merged,
            } => {
                let Some(value) = self.guard_remote_delta(chain, block_id, path, value.clone(), *merged) else {
                    return false;
                };
                chain.update_block(block_id, path, value).is_some()
            }
            OpPayload::Move {
                block_id,
                new_parent_id,
                new_prev_id,
            } => chain.move_block(block_id, new_parent_id, new_prev_id.as_ref()).is_some(),
            OpPayload::MoveRange {
                range: [start, end],
                new_parent_id,
                new_prev_id,
            } => chain
                .move_bulk(start, end, new_parent_id, new_prev_id.as_ref())
                .is_some(),
            OpPayload::Remove { block_id } => {
                let removed = chain.remove(block_id).is_some();
                if removed {
                    self.prune(chain);
                }
                removed
            }
        }
    }

    /// Decide what a remote write that may touch `delta` actually applies.
    ///
    /// A merged write only mirrors replica state: with a live replica it is
    /// dropped (a whole-payload write keeps the replica's content), without
    /// one the pre-write content is kept as the seed for the text update that
    /// follows. An untagged write replaces the text outright and discards any
    /// replica state, so the next edit seeds from the new content.
    fn guard_remote_delta(
        &mut self,
        chain: &BlockChain,
        block_id: &BlockId,
        path: &[String],
        value: Value,
        merged: bool,
    ) -> Option<Value> {
        let touches_delta = path.first().is_none_or(|p| p == DELTA_FIELD);
        if !touches_delta {
            return Some(value);
        }

        if !merged {
            if self.texts.contains_key(block_id) || self.bases.contains_key(block_id) {
                debug!("{} text rewritten remotely, discarding its replica", block_id);
                self.forget_block(block_id);
            }
            return Some(value);
        }

        if let Some(text) = self.texts.get(block_id) {
            if !path.is_empty() {
                trace!("{} has a live text replica, ignoring merged delta write", block_id);
                return None;
            }
            return match value {
                Value::Object(mut map) => {
                    map.insert(DELTA_FIELD.to_string(), text.to_delta().to_value());
                    Some(Value::Object(map))
                }
                other => Some(other),
            };
        }

        if !self.bases.contains_key(block_id)
            && let Some(block) = chain.get_block(block_id)
        {
            match Delta::from_value(block.data.delta_value().unwrap_or(&Value::Null)) {
                Ok(base) => {
                    self.bases.insert(block_id.clone(), base);
                }
                Err(e) => warn!("block {} holds an unreadable delta: {}", block_id, e),
            }
        }
        Some(value)
    }

    /// Drop text state for blocks that no longer exist.
    fn prune(&mut self, chain: &BlockChain) {
        self.texts.retain(|id, _| chain.contains(id));
        self.bases.retain(|id, _| chain.contains(id));
    }

    /// Forget text state for one block.
    pub fn forget_block(&mut self, block_id: &BlockId) {
        self.texts.remove(block_id);
        self.bases.remove(block_id);
    }

    // ── Text ────────────────────────────────────────────────────────────

    /// The block's replica, seeded on first use. Remote updates seed from a
    /// stashed base when there is one; local edits seed from the tree.
    fn replica(
        &mut self,
        chain: &BlockChain,
        block_id: &BlockId,
        from_base: bool,
    ) -> Result<Option<&mut SequenceText>, SyncError> {
        if !self.texts.contains_key(block_id) {
            let Some(block) = chain.get_block(block_id) else {
                return Ok(None);
            };
            let seed = match self.bases.remove(block_id) {
                Some(base) if from_base => base,
                _ => Delta::from_value(block.data.delta_value().unwrap_or(&Value::Null))?,
            };
            trace!("seeding text replica for {} ({} chars)", block_id, seed.len());
            self.texts
                .insert(block_id.clone(), SequenceText::seeded(self.client, &seed));
        }
        Ok(self.texts.get_mut(block_id))
    }

    /// Store merged content in the tree and log it as a merged `update`.
    fn write_back(&mut self, chain: &mut BlockChain, block_id: &BlockId, merged: &Delta) {
        let value = merged.to_value();
        let written = chain.with_origin(ChangeOrigin::Replica, |chain| {
            chain.update_block(block_id, &[DELTA_FIELD], value.clone()).is_some()
        });
        if written {
            self.send_ops(vec![OpPayload::Update {
                block_id: block_id.clone(),
                path: vec![DELTA_FIELD.to_string()],
                value,
                merged: true,
            }]);
        }
    }

    /// Apply a local change delta to a block's text. Returns the merged content,
    /// or None if the block is unknown.
    pub fn apply_local_text(
        &mut self,
        chain: &mut BlockChain,
        block_id: &BlockId,
        delta: &Delta,
    ) -> Result<Option<Delta>, SyncError> {
        let Some(text) = self.replica(chain, block_id, false)? else {
            debug!("apply_local_text: unknown block {}", block_id);
            return Ok(None);
        };
        let update = text.apply_local_delta(delta)?;
        let merged = text.to_delta();
        if !update.is_empty() {
            self.outgoing_text.push((block_id.clone(), update));
        }
        self.write_back(chain, block_id, &merged);
        Ok(Some(merged))
    }

    /// Replace a block's whole text with `content`, as the smallest local edit
    /// that gets there. Returns the merged content, or None if the block is unknown.
    pub fn replace_local_text(
        &mut self,
        chain: &mut BlockChain,
        block_id: &BlockId,
        content: &Delta,
    ) -> Result<Option<Delta>, SyncError> {
        let Some(text) = self.replica(chain, block_id, false)? else {
            debug!("replace_local_text: unknown block {}", block_id);
            return Ok(None);
        };
        let change = text.to_delta().diff(content);
        self.apply_local_text(chain, block_id, &change)
    }

    /// Merge a text update from another replica. Returns the merged content,
    /// or None if the block is unknown.
    pub fn receive_text_update(
        &mut self,
        chain: &mut BlockChain,
        block_id: &BlockId,
        update: &TextUpdate,
    ) -> Result<Option<Delta>, SyncError> {
        let Some(text) = self.replica(chain, block_id, true)? else {
            debug!("receive_text_update: unknown block {}", block_id);
            return Ok(None);
        };
        let merged = text.merge_remote_delta(update)?;
        self.write_back(chain, block_id, &merged);
        Ok(Some(merged))
    }

    /// Text updates produced locally since the last call, for the CRDT transport.
    pub fn take_text_updates(&mut self) -> Vec<(BlockId, TextUpdate)> {
        std::mem::take(&mut self.outgoing_text)
    }

    /// The live text replica of a block, if one exists.
    pub fn text_replica(&self, block_id: &BlockId) -> Option<&SequenceText> {
        self.texts.get(block_id)
    }

    // ── Remote notification feed ────────────────────────────────────────

    /// Fold one remote table notification into the tree. Malformed events are
    /// logged and dropped.
    pub fn fold_remote_event(&mut self, chain: &mut BlockChain, event: &RemoteEvent) -> bool {
        if event.is_block_table() {
            self.fold_block_event(chain, event)
        } else if event.is_children_table() {
            Self::fold_children_event(chain, event)
        } else {
            debug!("ignoring remote event for table {:?}", event.path.first());
            false
        }
    }

    fn fold_block_event(&mut self, chain: &mut BlockChain, event: &RemoteEvent) -> bool {
        let id = BlockId::from(event.id.as_str());
        match event.command {
            RemoteCommand::Inserted => {
                let Some(row) = parse_value::<BlockRow>(event) else {
                    return false;
                };
                if chain.contains(&id) {
                    trace!("remote insert of existing block {}", id);
                    return false;
                }
                let content = NewBlock::with_id(id, row.ty, row.data);
                chain.with_origin(ChangeOrigin::Remote, |chain| {
                    chain.insert_block(content, &row.parent, row.prev.as_ref()).is_some()
                })
            }
            RemoteCommand::Updated => {
                let Some(value) = parse_value::<Value>(event) else {
                    return false;
                };
                let path: Vec<String> = match event.field_path().split_first() {
                    None => Vec::new(),
                    Some((head, rest)) if head == "data" => rest.to_vec(),
                    Some((head, _)) => {
                        debug!("ignoring remote update to field {} of {}", head, id);
                        return false;
                    }
                };
                let Some(value) = self.guard_remote_delta(chain, &id, &path, value, false) else {
                    return false;
                };
                chain.with_origin(ChangeOrigin::Remote, |chain| chain.update_block(&id, &path, value).is_some())
            }
            RemoteCommand::Deleted => {
                let removed = chain.with_origin(ChangeOrigin::Remote, |chain| chain.remove(&id).is_some());
                if removed {
                    self.prune(chain);
                }
                removed
            }
        }
    }

    /// Re-splice children of `event.id` to match the given id order.
    fn fold_children_event(chain: &mut BlockChain, event: &RemoteEvent) -> bool {
        if event.command == RemoteCommand::Deleted {
            trace!("child-order row for {} deleted, nothing to do", event.id);
            return false;
        }
        let Some(order) = parse_value::<Vec<BlockId>>(event) else {
            return false;
        };
        let parent = BlockId::from(event.id.as_str());
        if !chain.contains(&parent) {
            debug!("child order for unknown parent {}", parent);
            return false;
        }

        chain.with_origin(ChangeOrigin::Remote, |chain| {
            let mut prev: Option<BlockId> = None;
            let mut changed = false;
            for child in &order {
                let Some(block) = chain.get_block(child) else {
                    debug!("child order for {} names unknown block {}", parent, child);
                    continue;
                };
                if block.parent.as_ref() != Some(&parent) || block.prev != prev {
                    if chain.move_block(child, &parent, prev.as_ref()).is_none() {
                        continue;
                    }
                    changed = true;
                }
                prev = Some(child.clone());
            }
            changed
        })
    }
}

fn parse_value<T: DeserializeOwned>(event: &RemoteEvent) -> Option<T> {
    let Some(raw) = event.value.as_deref() else {
        warn!("remote {:?} event for {} carries no value, dropping", event.command, event.id);
        return None;
    };
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("malformed remote value for {} at {:?}, dropping: {}", event.id, event.path, e);
            None
        }
    }
}
