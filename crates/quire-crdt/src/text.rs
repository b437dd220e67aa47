//! Replicated growable array for rich text.
//!
//! Every character is an item with a Lamport id `(clock, client)` and a left
//! origin (the item it was typed after). Remote items are placed right after
//! their origin, skipping any neighbours with a greater id, so every replica
//! that has seen the same items holds them in the same order:
//!
//! ```text
//!   origin ─┬─ (9, B) "y"     greater ids stay left of the newcomer
//!           ├─ (7, A) "x"     ← (8, C) lands here
//!           └─ ...
//! ```
//!
//! Deleted characters stay in the array as tombstones because later inserts
//! may name them as origin. Formatting is per character and per attribute
//! key, last writer wins by stamp.
//!
//! Each client also numbers its own ops with a contiguous sequence (`seq`).
//! The state vector reports, per client, the highest seq below which nothing
//! is missing, so `update_since` resends anything a lost update dropped.

use std::collections::{BTreeMap, BTreeSet};

use quire_types::ClientId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::delta::{Attributes, Delta, DeltaOp};
use crate::{CrdtError, Result, TextCrdt};

// ============================================================================
// Wire types
// ============================================================================

/// Lamport id of a character or a formatting stamp.
///
/// Ordered by clock first, client second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId {
    pub clock: u64,
    pub client: ClientId,
}

impl ItemId {
    pub fn new(clock: u64, client: ClientId) -> Self {
        Self { clock, client }
    }

    fn offset(self, n: usize) -> Self {
        Self {
            clock: self.clock + n as u64,
            client: self.client,
        }
    }
}

/// One replicated text operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TextOp {
    /// A run of characters. Character `i` has id `id.clock + i`, seq `seq + i`,
    /// and (for `i > 0`) the previous character of the run as origin.
    Insert {
        id: ItemId,
        seq: u64,
        origin: Option<ItemId>,
        text: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        attributes: Attributes,
    },
    /// Tombstone these characters.
    Delete { targets: Vec<ItemId> },
    /// Set (or with `null`, unset) attributes on these characters.
    Format {
        stamp: ItemId,
        seq: u64,
        targets: Vec<ItemId>,
        attributes: Attributes,
    },
}

/// A batch of text operations exchanged between replicas.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TextUpdate {
    pub ops: Vec<TextOp>,
}

impl TextUpdate {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// JSON bytes for the CRDT transport.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Per-client count of contiguously integrated ops.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector(BTreeMap<ClientId, u64>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client: ClientId) -> u64 {
        self.0.get(&client).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, u64)> + '_ {
        self.0.iter().map(|(c, n)| (*c, *n))
    }
}

// ============================================================================
// Internal state
// ============================================================================

#[derive(Clone, Debug)]
struct Item {
    id: ItemId,
    seq: u64,
    origin: Option<ItemId>,
    ch: char,
    deleted: bool,
    /// Attributes the character was inserted with.
    initial: Attributes,
    /// Effective attributes, each with the stamp that set it.
    attrs: BTreeMap<String, (ItemId, Value)>,
}

impl Item {
    fn effective_attributes(&self) -> Attributes {
        self.attrs
            .iter()
            .filter(|(_, (_, v))| !v.is_null())
            .map(|(k, (_, v))| (k.clone(), v.clone()))
            .collect()
    }

    fn set_attributes(&mut self, stamp: ItemId, attributes: &Attributes) {
        for (key, value) in attributes {
            let newer = self.attrs.get(key).is_none_or(|(current, _)| stamp > *current);
            if newer {
                self.attrs.insert(key.clone(), (stamp, value.clone()));
            }
        }
    }
}

#[derive(Clone, Debug)]
struct FormatRecord {
    stamp: ItemId,
    seq: u64,
    targets: Vec<ItemId>,
    attributes: Attributes,
}

/// Seqs seen from one client: a contiguous prefix plus stragglers.
#[derive(Clone, Debug, Default)]
struct SeqTracker {
    contiguous: u64,
    ahead: BTreeSet<u64>,
}

impl SeqTracker {
    fn contains(&self, seq: u64) -> bool {
        seq <= self.contiguous || self.ahead.contains(&seq)
    }

    fn record(&mut self, seq: u64) {
        if seq <= self.contiguous {
            return;
        }
        self.ahead.insert(seq);
        while self.ahead.remove(&(self.contiguous + 1)) {
            self.contiguous += 1;
        }
    }
}

// ============================================================================
// SequenceText
// ============================================================================

/// Text CRDT for one block.
#[derive(Clone, Debug)]
pub struct SequenceText {
    client: ClientId,
    clock: u64,
    items: Vec<Item>,
    seen: BTreeMap<ClientId, SeqTracker>,
    tombstones: BTreeSet<ItemId>,
    formats: Vec<FormatRecord>,
    parked: Vec<TextOp>,
}

impl SequenceText {
    /// Empty text owned by `client`.
    pub fn new(client: ClientId) -> Self {
        Self {
            client,
            clock: 0,
            items: Vec::new(),
            seen: BTreeMap::new(),
            tombstones: BTreeSet::new(),
            formats: Vec::new(),
            parked: Vec::new(),
        }
    }

    /// Build the initial state from a document delta.
    ///
    /// Seeded characters get `ClientId::GENESIS` ids numbered from 1, so every
    /// replica seeded from the same snapshot agrees on them. Non-insert ops in
    /// `doc` are ignored.
    pub fn seeded(client: ClientId, doc: &Delta) -> Self {
        let mut text = Self::new(client);
        let mut origin = None;
        let mut clock = 0;
        for op in &doc.ops {
            let DeltaOp::Insert { insert, attributes } = op else {
                debug!("seeding {client}: ignoring non-insert op");
                continue;
            };
            for ch in insert.chars() {
                clock += 1;
                let id = ItemId::new(clock, ClientId::GENESIS);
                let mut item = Item {
                    id,
                    seq: clock,
                    origin,
                    ch,
                    deleted: false,
                    initial: attributes.clone(),
                    attrs: BTreeMap::new(),
                };
                item.set_attributes(id, attributes);
                text.items.push(item);
                text.seen.entry(ClientId::GENESIS).or_default().record(clock);
                origin = Some(id);
            }
        }
        text.clock = clock;
        text
    }

    /// Rebuild a replica from a full update (`update_since` of an empty vector).
    pub fn from_update(client: ClientId, update: &TextUpdate) -> Result<Self> {
        let mut text = Self::new(client);
        text.merge(update)?;
        Ok(text)
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.items.iter().filter(|it| !it.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_text(&self) -> String {
        self.items.iter().filter(|it| !it.deleted).map(|it| it.ch).collect()
    }

    /// Ops waiting for a missing origin or target.
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    fn position(&self, id: ItemId) -> Option<usize> {
        self.items.iter().position(|it| it.id == id)
    }

    fn visible_ids(&self) -> Vec<ItemId> {
        self.items.iter().filter(|it| !it.deleted).map(|it| it.id).collect()
    }

    fn has_seen(&self, client: ClientId, seq: u64) -> bool {
        self.seen.get(&client).is_some_and(|t| t.contains(seq))
    }

    fn next_local(&self) -> (ItemId, u64) {
        let seq = self.seen.get(&self.client).map_or(0, |t| t.contiguous) + 1;
        (ItemId::new(self.clock + 1, self.client), seq)
    }

    // ── Integration ─────────────────────────────────────────────────────

    /// Integrate one op. Returns whatever part could not be placed yet.
    fn integrate(&mut self, op: TextOp) -> Option<TextOp> {
        match op {
            TextOp::Insert {
                id,
                seq,
                origin,
                text,
                attributes,
            } => self.integrate_insert(id, seq, origin, &text, attributes),
            TextOp::Delete { targets } => {
                let mut missing = Vec::new();
                for target in targets {
                    match self.position(target) {
                        Some(pos) => {
                            self.items[pos].deleted = true;
                            self.tombstones.insert(target);
                        }
                        None => missing.push(target),
                    }
                }
                (!missing.is_empty()).then_some(TextOp::Delete { targets: missing })
            }
            TextOp::Format {
                stamp,
                seq,
                targets,
                attributes,
            } => {
                self.clock = self.clock.max(stamp.clock);
                if !self.has_seen(stamp.client, seq) {
                    self.seen.entry(stamp.client).or_default().record(seq);
                    self.formats.push(FormatRecord {
                        stamp,
                        seq,
                        targets: targets.clone(),
                        attributes: attributes.clone(),
                    });
                }
                let mut missing = Vec::new();
                for target in targets {
                    match self.position(target) {
                        Some(pos) => self.items[pos].set_attributes(stamp, &attributes),
                        None => missing.push(target),
                    }
                }
                (!missing.is_empty()).then_some(TextOp::Format {
                    stamp,
                    seq,
                    targets: missing,
                    attributes,
                })
            }
        }
    }

    fn integrate_insert(
        &mut self,
        first: ItemId,
        first_seq: u64,
        mut origin: Option<ItemId>,
        text: &str,
        attributes: Attributes,
    ) -> Option<TextOp> {
        for (i, ch) in text.chars().enumerate() {
            let id = first.offset(i);
            let seq = first_seq + i as u64;
            if self.has_seen(id.client, seq) {
                origin = Some(id);
                continue;
            }

            let start = match origin {
                None => 0,
                Some(o) => match self.position(o) {
                    Some(p) => p + 1,
                    None => {
                        return Some(TextOp::Insert {
                            id,
                            seq,
                            origin,
                            text: text.chars().skip(i).collect(),
                            attributes,
                        });
                    }
                },
            };
            let mut pos = start;
            while pos < self.items.len() && self.items[pos].id > id {
                pos += 1;
            }

            let mut item = Item {
                id,
                seq,
                origin,
                ch,
                deleted: false,
                initial: attributes.clone(),
                attrs: BTreeMap::new(),
            };
            item.set_attributes(id, &attributes);
            self.items.insert(pos, item);
            self.seen.entry(id.client).or_default().record(seq);
            self.clock = self.clock.max(id.clock);
            origin = Some(id);
        }
        None
    }

    fn validate_op(op: &TextOp) -> Result<()> {
        match op {
            TextOp::Insert { id, seq, .. } if id.clock == 0 || *seq == 0 => {
                Err(CrdtError::InvalidUpdate(format!("insert with zero clock or seq: {id:?}")))
            }
            TextOp::Format { stamp, seq, .. } if stamp.clock == 0 || *seq == 0 => {
                Err(CrdtError::InvalidUpdate(format!("format with zero clock or seq: {stamp:?}")))
            }
            _ => Ok(()),
        }
    }

    /// Merge a remote update, then retry parked ops until nothing moves.
    fn merge(&mut self, update: &TextUpdate) -> Result<()> {
        for op in &update.ops {
            Self::validate_op(op)?;
        }
        for op in update.ops.iter().cloned() {
            if let Some(rest) = self.integrate(op) {
                self.parked.push(rest);
            }
        }

        loop {
            let parked = std::mem::take(&mut self.parked);
            let mut progress = false;
            for op in parked {
                match self.integrate(op.clone()) {
                    Some(rest) => {
                        progress |= rest != op;
                        self.parked.push(rest);
                    }
                    None => progress = true,
                }
            }
            if !progress {
                break;
            }
        }

        if !self.parked.is_empty() {
            trace!("{} text ops parked awaiting causal predecessors", self.parked.len());
        }
        Ok(())
    }

    // ── Local edits ─────────────────────────────────────────────────────

    fn local_insert(&mut self, visible: &[ItemId], pos: usize, text: &str, attributes: &Attributes) -> Option<TextOp> {
        if text.is_empty() {
            return None;
        }
        let (id, seq) = self.next_local();
        let op = TextOp::Insert {
            id,
            seq,
            origin: pos.checked_sub(1).map(|p| visible[p]),
            text: text.to_string(),
            attributes: attributes.clone(),
        };
        self.integrate(op.clone());
        Some(op)
    }

    fn local_delete(&mut self, targets: &[ItemId]) -> Option<TextOp> {
        if targets.is_empty() {
            return None;
        }
        let op = TextOp::Delete {
            targets: targets.to_vec(),
        };
        self.integrate(op.clone());
        Some(op)
    }

    fn local_format(&mut self, targets: &[ItemId], attributes: &Attributes) -> Option<TextOp> {
        if targets.is_empty() || attributes.is_empty() {
            return None;
        }
        let (stamp, seq) = self.next_local();
        let op = TextOp::Format {
            stamp,
            seq,
            targets: targets.to_vec(),
            attributes: attributes.clone(),
        };
        self.integrate(op.clone());
        Some(op)
    }
}

impl TextCrdt for SequenceText {
    fn apply_local_delta(&mut self, delta: &Delta) -> Result<TextUpdate> {
        let base: usize = delta
            .ops
            .iter()
            .filter(|op| !op.is_insert())
            .map(DeltaOp::len)
            .sum();
        let len = self.len();
        if base > len {
            return Err(CrdtError::PositionOutOfBounds { pos: base, len });
        }

        let mut update = TextUpdate::default();
        let mut pos = 0;
        for op in &delta.ops {
            let visible = self.visible_ids();
            let produced = match op {
                DeltaOp::Retain { retain, attributes } => {
                    let end = pos + retain;
                    let produced = self.local_format(&visible[pos..end], attributes);
                    pos = end;
                    produced
                }
                DeltaOp::Insert { insert, attributes } => {
                    let produced = self.local_insert(&visible, pos, insert, attributes);
                    pos += insert.chars().count();
                    produced
                }
                DeltaOp::Delete { delete } => self.local_delete(&visible[pos..pos + delete]),
            };
            update.ops.extend(produced);
        }
        Ok(update)
    }

    fn merge_remote_delta(&mut self, update: &TextUpdate) -> Result<Delta> {
        self.merge(update)?;
        Ok(self.to_delta())
    }

    fn to_delta(&self) -> Delta {
        self.items
            .iter()
            .filter(|it| !it.deleted)
            .map(|it| DeltaOp::Insert {
                insert: it.ch.to_string(),
                attributes: it.effective_attributes(),
            })
            .collect()
    }

    fn state_vector(&self) -> StateVector {
        StateVector(
            self.seen
                .iter()
                .filter(|(_, t)| t.contiguous > 0)
                .map(|(c, t)| (*c, t.contiguous))
                .collect(),
        )
    }

    fn update_since(&self, sv: &StateVector) -> TextUpdate {
        let mut ops = Vec::new();

        // Inserts in array order, so every origin precedes its dependents.
        let mut run: Option<(TextOp, ItemId, u64)> = None;
        for item in &self.items {
            if item.seq <= sv.get(item.id.client) {
                ops.extend(run.take().map(|(op, _, _)| op));
                continue;
            }
            if let Some((TextOp::Insert { text, attributes, .. }, last, last_seq)) = run.as_mut()
                && item.id == last.offset(1)
                && item.seq == *last_seq + 1
                && item.origin == Some(*last)
                && item.initial == *attributes
            {
                text.push(item.ch);
                *last = item.id;
                *last_seq = item.seq;
                continue;
            }
            ops.extend(run.take().map(|(op, _, _)| op));
            run = Some((
                TextOp::Insert {
                    id: item.id,
                    seq: item.seq,
                    origin: item.origin,
                    text: item.ch.to_string(),
                    attributes: item.initial.clone(),
                },
                item.id,
                item.seq,
            ));
        }
        ops.extend(run.map(|(op, _, _)| op));

        for f in &self.formats {
            if f.seq > sv.get(f.stamp.client) {
                ops.push(TextOp::Format {
                    stamp: f.stamp,
                    seq: f.seq,
                    targets: f.targets.clone(),
                    attributes: f.attributes.clone(),
                });
            }
        }

        if !self.tombstones.is_empty() {
            ops.push(TextOp::Delete {
                targets: self.tombstones.iter().copied().collect(),
            });
        }

        TextUpdate { ops }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);
    const C: ClientId = ClientId(3);

    fn doc(s: &str) -> Delta {
        Delta::new().insert_plain(s)
    }

    fn insert_at(pos: usize, s: &str) -> Delta {
        Delta::new().retain(pos, Attributes::new()).insert_plain(s)
    }

    fn bold() -> Attributes {
        let mut a = Attributes::new();
        a.insert("bold".into(), json!(true));
        a
    }

    #[test]
    fn test_seeded_replicas_share_ids() {
        let a = SequenceText::seeded(A, &doc("hello"));
        let b = SequenceText::seeded(B, &doc("hello"));
        assert_eq!(a.to_text(), "hello");
        assert_eq!(a.state_vector(), b.state_vector());
        assert!(a.update_since(&b.state_vector()).is_empty());
    }

    #[test]
    fn test_local_delta_edits_text() {
        let mut t = SequenceText::seeded(A, &doc("Hello world"));
        t.apply_local_delta(&insert_at(5, ",")).unwrap();
        assert_eq!(t.to_text(), "Hello, world");
        t.apply_local_delta(&Delta::new().delete(7)).unwrap();
        assert_eq!(t.to_text(), "world");
        t.apply_local_delta(&Delta::new().retain(2, bold())).unwrap();
        assert_eq!(t.to_delta(), Delta::new().insert("wo", bold()).insert_plain("rld"));
    }

    #[test]
    fn test_out_of_bounds_delta_is_rejected_untouched() {
        let mut t = SequenceText::seeded(A, &doc("abc"));
        let err = t.apply_local_delta(&Delta::new().retain(2, Attributes::new()).delete(5));
        assert!(matches!(err, Err(CrdtError::PositionOutOfBounds { pos: 7, len: 3 })));
        assert_eq!(t.to_text(), "abc");
    }

    #[test]
    fn test_concurrent_inserts_at_same_offset_converge() {
        let mut a = SequenceText::seeded(A, &doc("ab"));
        let mut b = SequenceText::seeded(B, &doc("ab"));

        let ua = a.apply_local_delta(&insert_at(1, "X")).unwrap();
        let ub = b.apply_local_delta(&insert_at(1, "Y")).unwrap();

        let merged_a = a.merge_remote_delta(&ub).unwrap();
        let merged_b = b.merge_remote_delta(&ua).unwrap();

        assert_eq!(merged_a, merged_b);
        assert_eq!(a.to_text(), b.to_text());
        assert_eq!(a.to_text().len(), 4);
        assert!(a.to_text().starts_with('a') && a.to_text().ends_with('b'));
    }

    #[test]
    fn test_application_order_does_not_matter() {
        let seed = doc("base");
        let mut a = SequenceText::seeded(A, &seed);
        let mut b = SequenceText::seeded(B, &seed);
        let ua = a.apply_local_delta(&insert_at(2, "one")).unwrap();
        let ub = b.apply_local_delta(&insert_at(2, "two")).unwrap();

        let mut c1 = SequenceText::seeded(C, &seed);
        c1.merge_remote_delta(&ua).unwrap();
        c1.merge_remote_delta(&ub).unwrap();

        let mut c2 = SequenceText::seeded(C, &seed);
        c2.merge_remote_delta(&ub).unwrap();
        c2.merge_remote_delta(&ua).unwrap();

        assert_eq!(c1.to_text(), c2.to_text());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = SequenceText::seeded(A, &doc("abc"));
        let mut b = SequenceText::seeded(B, &doc("abc"));
        let u = a.apply_local_delta(&insert_at(3, "d").delete(0)).unwrap();
        b.merge_remote_delta(&u).unwrap();
        let once = b.to_delta();
        b.merge_remote_delta(&u).unwrap();
        assert_eq!(b.to_delta(), once);
        assert_eq!(b.to_text(), "abcd");
    }

    #[test]
    fn test_out_of_order_updates_are_parked() {
        let mut a = SequenceText::seeded(A, &doc(""));
        let u1 = a.apply_local_delta(&doc("hi")).unwrap();
        let u2 = a.apply_local_delta(&insert_at(2, " there")).unwrap();
        let u3 = a.apply_local_delta(&Delta::new().delete(1)).unwrap();

        let mut b = SequenceText::new(B);
        b.merge_remote_delta(&u3).unwrap();
        b.merge_remote_delta(&u2).unwrap();
        assert_eq!(b.to_text(), "");
        assert_eq!(b.parked_len(), 2);

        b.merge_remote_delta(&u1).unwrap();
        assert_eq!(b.parked_len(), 0);
        assert_eq!(b.to_text(), a.to_text());
        assert_eq!(b.to_text(), "i there");
    }

    #[test]
    fn test_concurrent_format_last_writer_wins() {
        let mut a = SequenceText::seeded(A, &doc("abc"));
        let mut b = SequenceText::seeded(B, &doc("abc"));
        let mut red = Attributes::new();
        red.insert("color".into(), json!("red"));
        let mut blue = Attributes::new();
        blue.insert("color".into(), json!("blue"));

        let ua = a.apply_local_delta(&Delta::new().retain(3, red)).unwrap();
        let ub = b.apply_local_delta(&Delta::new().retain(3, blue)).unwrap();
        a.merge_remote_delta(&ub).unwrap();
        b.merge_remote_delta(&ua).unwrap();

        assert_eq!(a.to_delta(), b.to_delta());
        // Equal clocks: the higher client id stamps last.
        let DeltaOp::Insert { attributes, .. } = &a.to_delta().ops[0] else {
            panic!("expected insert");
        };
        assert_eq!(attributes["color"], json!("blue"));
    }

    #[test]
    fn test_update_since_catches_up_late_replica() {
        let mut a = SequenceText::seeded(A, &doc("abc"));
        a.apply_local_delta(&insert_at(1, "XY")).unwrap();
        a.apply_local_delta(&Delta::new().retain(1, bold()).delete(1)).unwrap();

        let full = a.update_since(&StateVector::new());
        let late = SequenceText::from_update(C, &full).unwrap();
        assert_eq!(late.to_delta(), a.to_delta());

        let mut seeded = SequenceText::seeded(B, &doc("abc"));
        let diff = a.update_since(&seeded.state_vector());
        seeded.merge_remote_delta(&diff).unwrap();
        assert_eq!(seeded.to_delta(), a.to_delta());
    }

    #[test]
    fn test_update_encode_decode() {
        let mut a = SequenceText::seeded(A, &doc("ab"));
        let u = a.apply_local_delta(&insert_at(1, "é")).unwrap();
        let bytes = u.encode().unwrap();
        assert_eq!(TextUpdate::decode(&bytes).unwrap(), u);
        assert!(TextUpdate::decode(b"not json").is_err());
    }

    #[test]
    fn test_zero_clock_update_is_invalid() {
        let mut t = SequenceText::new(A);
        let bad = TextUpdate {
            ops: vec![TextOp::Insert {
                id: ItemId::new(0, B),
                seq: 1,
                origin: None,
                text: "x".into(),
                attributes: Attributes::new(),
            }],
        };
        assert!(matches!(t.merge_remote_delta(&bad), Err(CrdtError::InvalidUpdate(_))));
    }

    /// Three replicas edit concurrently; updates are delivered shuffled and
    /// duplicated. Everyone must end with the same content.
    #[test]
    fn test_random_concurrent_edits_converge() {
        let mut rng = StdRng::seed_from_u64(0x51de);
        for _round in 0..20 {
            let seed = doc("seed text");
            let mut replicas = [
                SequenceText::seeded(A, &seed),
                SequenceText::seeded(B, &seed),
                SequenceText::seeded(C, &seed),
            ];
            let mut outbox: Vec<(usize, TextUpdate)> = Vec::new();

            for _ in 0..30 {
                let r = rng.gen_range(0..replicas.len());
                let len = replicas[r].len();
                let pos = rng.gen_range(0..=len);
                let delta = match rng.gen_range(0..3) {
                    0 if len > pos => Delta::new()
                        .retain(pos, Attributes::new())
                        .delete(rng.gen_range(1..=(len - pos).min(3))),
                    1 if len > pos => Delta::new().retain(pos, Attributes::new()).retain(1, bold()),
                    _ => insert_at(pos, ["x", "yz", "ü"][rng.gen_range(0..3)]),
                };
                let update = replicas[r].apply_local_delta(&delta).unwrap();
                outbox.push((r, update));

                // Occasionally deliver something early.
                if rng.gen_bool(0.3) && !outbox.is_empty() {
                    let (from, u) = outbox[rng.gen_range(0..outbox.len())].clone();
                    let to = (from + 1) % replicas.len();
                    replicas[to].merge_remote_delta(&u).unwrap();
                }
            }

            outbox.shuffle(&mut rng);
            for (from, update) in &outbox {
                for (to, replica) in replicas.iter_mut().enumerate() {
                    if to != *from {
                        replica.merge_remote_delta(update).unwrap();
                    }
                }
            }

            let expected = replicas[0].to_delta();
            for replica in &replicas {
                assert_eq!(replica.parked_len(), 0);
                assert_eq!(replica.to_delta(), expected);
            }
        }
    }
}
