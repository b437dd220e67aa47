//! Rich-text deltas.
//!
//! A `Delta` is a list of `insert` / `retain` / `delete` operations in the
//! quill JSON shape. A delta made only of inserts is a *document*: the content
//! of one text block. Any other delta is a *change* applied to a document with
//! [`Delta::compose`].
//!
//! Lengths count Unicode scalar values (`char`s), never bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{CrdtError, Result};

/// Attribute map on an insert or retain (`{"bold": true}`).
///
/// On a retain, a `null` value removes the attribute.
pub type Attributes = BTreeMap<String, Value>;

/// One delta operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeltaOp {
    Insert {
        insert: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        attributes: Attributes,
    },
    Retain {
        retain: usize,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        attributes: Attributes,
    },
    Delete {
        delete: usize,
    },
}

impl DeltaOp {
    /// Length in chars.
    pub fn len(&self) -> usize {
        match self {
            DeltaOp::Insert { insert, .. } => insert.chars().count(),
            DeltaOp::Retain { retain, .. } => *retain,
            DeltaOp::Delete { delete } => *delete,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, DeltaOp::Insert { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, DeltaOp::Delete { .. })
    }

    /// Attributes carried by this op (deletes carry none).
    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            DeltaOp::Insert { attributes, .. } | DeltaOp::Retain { attributes, .. } => Some(attributes),
            DeltaOp::Delete { .. } => None,
        }
    }

    /// Sub-operation covering `len` chars starting at `offset`.
    fn piece(&self, offset: usize, len: usize) -> DeltaOp {
        match self {
            DeltaOp::Insert { insert, attributes } => DeltaOp::Insert {
                insert: insert.chars().skip(offset).take(len).collect(),
                attributes: attributes.clone(),
            },
            DeltaOp::Retain { attributes, .. } => DeltaOp::Retain {
                retain: len,
                attributes: attributes.clone(),
            },
            DeltaOp::Delete { .. } => DeltaOp::Delete { delete: len },
        }
    }
}

/// An ordered list of delta operations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Delta {
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Parse a stored `delta` payload. `null` is an empty document.
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::new());
        }
        let raw: Vec<DeltaOp> =
            serde_json::from_value(value.clone()).map_err(|e| CrdtError::InvalidDelta(e.to_string()))?;
        Ok(raw.into_iter().collect())
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.ops).unwrap_or(Value::Array(Vec::new()))
    }

    /// Builder: append an insert.
    pub fn insert(mut self, text: impl Into<String>, attributes: Attributes) -> Self {
        self.push(DeltaOp::Insert {
            insert: text.into(),
            attributes,
        });
        self
    }

    /// Builder: append a plain insert.
    pub fn insert_plain(self, text: impl Into<String>) -> Self {
        self.insert(text, Attributes::new())
    }

    /// Builder: append a retain.
    pub fn retain(mut self, n: usize, attributes: Attributes) -> Self {
        self.push(DeltaOp::Retain { retain: n, attributes });
        self
    }

    /// Builder: append a delete.
    pub fn delete(mut self, n: usize) -> Self {
        self.push(DeltaOp::Delete { delete: n });
        self
    }

    /// Append an op, merging with the previous one when kind and attributes match.
    pub fn push(&mut self, op: DeltaOp) {
        if op.is_empty() {
            return;
        }
        match (self.ops.last_mut(), op) {
            (
                Some(DeltaOp::Insert { insert, attributes }),
                DeltaOp::Insert {
                    insert: more,
                    attributes: more_attrs,
                },
            ) if *attributes == more_attrs => insert.push_str(&more),
            (
                Some(DeltaOp::Retain { retain, attributes }),
                DeltaOp::Retain {
                    retain: more,
                    attributes: more_attrs,
                },
            ) if *attributes == more_attrs => *retain += more,
            (Some(DeltaOp::Delete { delete }), DeltaOp::Delete { delete: more }) => *delete += more,
            (_, op) => self.ops.push(op),
        }
    }

    /// Target length: chars inserted plus chars retained.
    pub fn len(&self) -> usize {
        self.ops.iter().filter(|op| !op.is_delete()).map(DeltaOp::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// A document delta contains only inserts.
    pub fn is_document(&self) -> bool {
        self.ops.iter().all(DeltaOp::is_insert)
    }

    /// Plain text of the inserted content.
    pub fn to_text(&self) -> String {
        self.ops
            .iter()
            .filter_map(|op| match op {
                DeltaOp::Insert { insert, .. } => Some(insert.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The part of the delta covering chars `start..end` (deletes are skipped).
    pub fn slice(&self, start: usize, end: usize) -> Delta {
        let mut out = Delta::new();
        let mut cursor = OpCursor::new(&self.ops);
        let mut index = 0;
        while index < end && cursor.has_next() {
            if cursor.peek_is_delete() {
                cursor.next(usize::MAX);
                continue;
            }
            if index < start {
                let skipped = cursor.next(start - index);
                index += skipped.len();
            } else {
                let taken = cursor.next(end - index);
                index += taken.len();
                out.push(taken);
            }
        }
        out
    }

    /// Append another delta's ops.
    pub fn concat(&self, other: &Delta) -> Delta {
        let mut out = self.clone();
        for op in &other.ops {
            out.push(op.clone());
        }
        out
    }

    /// Change turning document `self` into document `other`.
    ///
    /// The common prefix and suffix (text and attributes alike) are kept and
    /// only the differing middle is replaced.
    pub fn diff(&self, other: &Delta) -> Delta {
        let from = self.styled_chars();
        let to = other.styled_chars();
        let prefix = from.iter().zip(&to).take_while(|(a, b)| a == b).count();
        let suffix = from[prefix..]
            .iter()
            .rev()
            .zip(to[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();

        Delta::new()
            .retain(prefix, Attributes::new())
            .delete(from.len() - prefix - suffix)
            .concat(&other.slice(prefix, to.len() - suffix))
            .chop()
    }

    fn styled_chars(&self) -> Vec<(char, &Attributes)> {
        let mut out = Vec::new();
        for op in &self.ops {
            if let DeltaOp::Insert { insert, attributes } = op {
                out.extend(insert.chars().map(|c| (c, attributes)));
            }
        }
        out
    }

    /// Apply `other` on top of `self`.
    ///
    /// Composing a document with a change yields the changed document.
    pub fn compose(&self, other: &Delta) -> Delta {
        let mut this = OpCursor::new(&self.ops);
        let mut that = OpCursor::new(&other.ops);
        let mut out = Delta::new();

        while this.has_next() || that.has_next() {
            if that.peek_is_insert() {
                out.push(that.next(usize::MAX));
                continue;
            }
            if this.peek_is_delete() {
                out.push(this.next(usize::MAX));
                continue;
            }

            let len = this.peek_len().min(that.peek_len());
            let a = this.next(len);
            let b = that.next(len);

            match (a, b) {
                (DeltaOp::Insert { insert, attributes }, DeltaOp::Retain { attributes: over, .. }) => {
                    out.push(DeltaOp::Insert {
                        insert,
                        attributes: compose_attributes(&attributes, &over, false),
                    });
                }
                (DeltaOp::Retain { retain, attributes }, DeltaOp::Retain { attributes: over, .. }) => {
                    out.push(DeltaOp::Retain {
                        retain,
                        attributes: compose_attributes(&attributes, &over, true),
                    });
                }
                (DeltaOp::Retain { .. }, delete @ DeltaOp::Delete { .. }) => out.push(delete),
                // Insert followed by delete cancels out.
                _ => {}
            }
        }

        out.chop()
    }

    /// Drop a trailing attribute-free retain.
    fn chop(mut self) -> Self {
        if let Some(DeltaOp::Retain { attributes, .. }) = self.ops.last()
            && attributes.is_empty()
        {
            self.ops.pop();
        }
        self
    }
}

impl FromIterator<DeltaOp> for Delta {
    fn from_iter<I: IntoIterator<Item = DeltaOp>>(iter: I) -> Self {
        let mut delta = Delta::new();
        for op in iter {
            delta.push(op);
        }
        delta
    }
}

/// Merge attribute maps; `over` wins. Null values are dropped unless `keep_null`.
pub fn compose_attributes(base: &Attributes, over: &Attributes, keep_null: bool) -> Attributes {
    let mut out = base.clone();
    for (key, value) in over {
        out.insert(key.clone(), value.clone());
    }
    if !keep_null {
        out.retain(|_, v| !v.is_null());
    }
    out
}

/// Walks a list of ops, handing out pieces of a requested length.
///
/// Past the end it yields unbounded attribute-free retains.
struct OpCursor<'a> {
    ops: &'a [DeltaOp],
    index: usize,
    offset: usize,
}

impl<'a> OpCursor<'a> {
    fn new(ops: &'a [DeltaOp]) -> Self {
        Self { ops, index: 0, offset: 0 }
    }

    fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    fn peek_len(&self) -> usize {
        match self.ops.get(self.index) {
            Some(op) => op.len() - self.offset,
            None => usize::MAX,
        }
    }

    fn peek_is_insert(&self) -> bool {
        self.ops.get(self.index).is_some_and(DeltaOp::is_insert)
    }

    fn peek_is_delete(&self) -> bool {
        self.ops.get(self.index).is_some_and(DeltaOp::is_delete)
    }

    fn next(&mut self, len: usize) -> DeltaOp {
        let Some(op) = self.ops.get(self.index) else {
            return DeltaOp::Retain {
                retain: len,
                attributes: Attributes::new(),
            };
        };
        let remaining = op.len() - self.offset;
        let take = len.min(remaining);
        let piece = op.piece(self.offset, take);
        if take == remaining {
            self.index += 1;
            self.offset = 0;
        } else {
            self.offset += take;
        }
        piece
    }
}
