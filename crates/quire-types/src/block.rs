//! Block types, payloads, and the hydration snapshot format.
//!
//! ## Design: BlockType + BlockData
//!
//! `BlockType` says what a block *is*. Everything type-specific (heading level,
//! checked state, code language, the rich-text `delta`) lives in `BlockData`,
//! an untyped JSON object. Keeping the payload untyped lets `update` operations
//! address any field by path without a schema migration per block type.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::EnumString;

use crate::ids::BlockId;

/// What a block *is*.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive, serialize_all = "snake_case")]
pub enum BlockType {
    /// Document root. Exactly one per document.
    Page,
    /// Plain paragraph.
    #[default]
    #[strum(serialize = "text", serialize = "paragraph")]
    Text,
    /// Heading; `data.level` holds 1..=6.
    Heading,
    /// Checkbox item; `data.checked` holds the state.
    #[strum(serialize = "todo_list", serialize = "todo")]
    TodoList,
    #[strum(serialize = "bulleted_list", serialize = "bullet")]
    BulletedList,
    #[strum(serialize = "numbered_list", serialize = "numbered")]
    NumberedList,
    /// Collapsible list; children are hidden when `data.collapsed` is true.
    ToggleList,
    Quote,
    Callout,
    /// Code block; `data.language` holds the language tag.
    Code,
    /// Horizontal rule. Carries no text.
    Divider,
    /// Horizontal container of `Column` children.
    Columns,
    /// One column inside `Columns`.
    Column,
}

/// Where the line created by splitting a block goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitRelationship {
    /// New block is inserted right after the split block.
    NextSibling,
    /// New block becomes the split block's first child.
    FirstChild,
}

/// Split behavior per block type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SplitBehavior {
    /// Type of the newly created line.
    pub next_type: BlockType,
    /// Placement of the newly created line.
    pub relationship: SplitRelationship,
}

impl BlockType {
    /// Parse from string (case-insensitive, with aliases).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Convert to the canonical wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Page => "page",
            BlockType::Text => "text",
            BlockType::Heading => "heading",
            BlockType::TodoList => "todo_list",
            BlockType::BulletedList => "bulleted_list",
            BlockType::NumberedList => "numbered_list",
            BlockType::ToggleList => "toggle_list",
            BlockType::Quote => "quote",
            BlockType::Callout => "callout",
            BlockType::Code => "code",
            BlockType::Divider => "divider",
            BlockType::Columns => "columns",
            BlockType::Column => "column",
        }
    }

    /// Whether this block carries a rich-text `delta`.
    pub fn has_text(&self) -> bool {
        !matches!(self, BlockType::Divider | BlockType::Columns | BlockType::Column)
    }

    /// Whether this block may hold children.
    pub fn can_have_children(&self) -> bool {
        !matches!(self, BlockType::Divider | BlockType::Code)
    }

    /// What pressing enter inside this block produces.
    pub fn split_behavior(&self) -> SplitBehavior {
        use SplitRelationship::*;
        let (next_type, relationship) = match self {
            BlockType::Page => (BlockType::Text, FirstChild),
            BlockType::ToggleList => (BlockType::Text, FirstChild),
            BlockType::TodoList => (BlockType::TodoList, NextSibling),
            BlockType::BulletedList => (BlockType::BulletedList, NextSibling),
            BlockType::NumberedList => (BlockType::NumberedList, NextSibling),
            _ => (BlockType::Text, NextSibling),
        };
        SplitBehavior { next_type, relationship }
    }
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error from a deep-set into a block payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataPathError {
    /// An intermediate value on the path is a scalar.
    #[error("cannot descend into non-container value at '{segment}'")]
    NotAContainer { segment: String },
    /// An array segment is not a valid index.
    #[error("invalid array index '{segment}' (len {len})")]
    BadIndex { segment: String, len: usize },
    /// Replacing the whole payload requires a JSON object.
    #[error("block payload must be a JSON object")]
    NotAnObject,
}

/// Type-dependent block payload (always a JSON object).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockData(Map<String, Value>);

impl BlockData {
    /// Empty payload.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from any JSON value; non-objects are rejected.
    pub fn from_value(value: Value) -> Result<Self, DataPathError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            _ => Err(DataPathError::NotAnObject),
        }
    }

    /// Payload holding a single `delta` field.
    pub fn with_delta(delta: Value) -> Self {
        let mut map = Map::new();
        map.insert("delta".to_string(), delta);
        Self(map)
    }

    /// Borrow the raw object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Clone into a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Top-level field lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The rich-text `delta` field, if any.
    pub fn delta_value(&self) -> Option<&Value> {
        self.0.get("delta")
    }

    /// Read the value at `path`. An empty path is not addressable here; use
    /// [`BlockData::to_value`] for the whole payload.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(first.as_ref())?;
        for segment in rest {
            current = match current {
                Value::Object(map) => map.get(segment.as_ref())?,
                Value::Array(items) => items.get(segment.as_ref().parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Deep-set `value` at `path`, creating intermediate objects as needed.
    ///
    /// An empty path replaces the whole payload (which must be an object).
    /// Setting the same value twice leaves the payload unchanged.
    pub fn set_path<S: AsRef<str>>(&mut self, path: &[S], value: Value) -> Result<(), DataPathError> {
        let Some((last, parents)) = path.split_last() else {
            *self = Self::from_value(value)?;
            return Ok(());
        };

        let Some((first, middle)) = parents.split_first() else {
            self.0.insert(last.as_ref().to_string(), value);
            return Ok(());
        };

        let mut current = self
            .0
            .entry(first.as_ref().to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        for segment in middle {
            current = descend(current, segment.as_ref())?;
        }

        match current {
            Value::Object(map) => {
                map.insert(last.as_ref().to_string(), value);
                Ok(())
            }
            Value::Array(items) => {
                let len = items.len();
                let idx = last
                    .as_ref()
                    .parse::<usize>()
                    .ok()
                    .filter(|i| *i <= len)
                    .ok_or_else(|| DataPathError::BadIndex {
                        segment: last.as_ref().to_string(),
                        len,
                    })?;
                if idx == len {
                    items.push(value);
                } else {
                    items[idx] = value;
                }
                Ok(())
            }
            _ => Err(DataPathError::NotAContainer {
                segment: last.as_ref().to_string(),
            }),
        }
    }
}

fn descend<'a>(current: &'a mut Value, segment: &str) -> Result<&'a mut Value, DataPathError> {
    match current {
        Value::Object(map) => Ok(map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()))),
        Value::Array(items) => {
            let len = items.len();
            segment
                .parse::<usize>()
                .ok()
                .and_then(move |i| items.get_mut(i))
                .ok_or(DataPathError::BadIndex {
                    segment: segment.to_string(),
                    len,
                })
        }
        _ => Err(DataPathError::NotAContainer {
            segment: segment.to_string(),
        }),
    }
}

impl From<Map<String, Value>> for BlockData {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Content for a block about to be created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewBlock {
    pub id: BlockId,
    #[serde(rename = "type")]
    pub ty: BlockType,
    #[serde(default)]
    pub data: BlockData,
}

impl NewBlock {
    /// New block with a freshly minted id.
    pub fn new(ty: BlockType, data: BlockData) -> Self {
        Self {
            id: BlockId::new(),
            ty,
            data,
        }
    }

    /// New block with a caller-chosen id.
    pub fn with_id(id: impl Into<BlockId>, ty: BlockType, data: BlockData) -> Self {
        Self {
            id: id.into(),
            ty,
            data,
        }
    }
}

/// One entry of the flat hydration map.
///
/// Only `next` and `firstChild` are stored; `parent` and `prev` are derived
/// while rebuilding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    #[serde(rename = "type")]
    pub ty: BlockType,
    #[serde(default)]
    pub data: BlockData,
    #[serde(default)]
    pub next: Option<BlockId>,
    #[serde(default)]
    pub first_child: Option<BlockId>,
}

/// Flat hydration snapshot supplied by a document-open call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentData {
    pub root_id: BlockId,
    pub blocks: HashMap<BlockId, BlockRecord>,
}

impl DocumentData {
    /// A document holding only an empty page root.
    pub fn empty_page(root_id: impl Into<BlockId>) -> Self {
        let root_id = root_id.into();
        let mut blocks = HashMap::new();
        blocks.insert(
            root_id.clone(),
            BlockRecord {
                ty: BlockType::Page,
                data: BlockData::new(),
                next: None,
                first_child: None,
            },
        );
        Self { root_id, blocks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_block_type_parse_aliases() {
        assert_eq!(BlockType::from_str("paragraph"), Some(BlockType::Text));
        assert_eq!(BlockType::from_str("TODO_LIST"), Some(BlockType::TodoList));
        assert_eq!(BlockType::from_str("bullet"), Some(BlockType::BulletedList));
        assert_eq!(BlockType::from_str("nope"), None);
    }

    #[test]
    fn test_block_type_wire_form_matches_as_str() {
        for ty in [BlockType::Page, BlockType::TodoList, BlockType::Columns] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{}\"", ty.as_str()));
        }
    }

    #[test]
    fn test_split_behavior() {
        let list = BlockType::NumberedList.split_behavior();
        assert_eq!(list.next_type, BlockType::NumberedList);
        assert_eq!(list.relationship, SplitRelationship::NextSibling);

        let heading = BlockType::Heading.split_behavior();
        assert_eq!(heading.next_type, BlockType::Text);

        let toggle = BlockType::ToggleList.split_behavior();
        assert_eq!(toggle.relationship, SplitRelationship::FirstChild);
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut data = BlockData::new();
        data.set_path(&["style", "font", "size"], json!(14)).unwrap();
        assert_eq!(data.to_value(), json!({"style": {"font": {"size": 14}}}));
        assert_eq!(data.get_path(&["style", "font", "size"]), Some(&json!(14)));
    }

    #[test]
    fn test_set_path_is_idempotent() {
        let mut once = BlockData::new();
        once.set_path(&["level"], json!(2)).unwrap();
        let mut twice = once.clone();
        twice.set_path(&["level"], json!(2)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_set_path_into_array() {
        let mut data = BlockData::from_value(json!({"delta": [{"insert": "a"}]})).unwrap();
        data.set_path(&["delta", "0", "insert"], json!("b")).unwrap();
        data.set_path(&["delta", "1"], json!({"insert": "c"})).unwrap();
        assert_eq!(data.to_value(), json!({"delta": [{"insert": "b"}, {"insert": "c"}]}));

        let err = data.set_path(&["delta", "9"], json!(null)).unwrap_err();
        assert_eq!(err, DataPathError::BadIndex { segment: "9".into(), len: 2 });
    }

    #[test]
    fn test_set_path_through_scalar_fails() {
        let mut data = BlockData::from_value(json!({"level": 1})).unwrap();
        let err = data.set_path(&["level", "x"], json!(true)).unwrap_err();
        assert!(matches!(err, DataPathError::NotAContainer { .. }));
    }

    #[test]
    fn test_empty_path_replaces_payload() {
        let mut data = BlockData::from_value(json!({"level": 1})).unwrap();
        data.set_path::<&str>(&[], json!({"checked": true})).unwrap();
        assert_eq!(data.to_value(), json!({"checked": true}));
        assert_eq!(data.set_path::<&str>(&[], json!(3)), Err(DataPathError::NotAnObject));
    }

    #[test]
    fn test_hydration_wire_names() {
        let raw = json!({
            "rootId": "page",
            "blocks": {
                "page": {"type": "page", "data": {}, "next": null, "firstChild": "a"},
                "a": {"type": "text", "data": {"delta": []}, "next": null, "firstChild": null}
            }
        });
        let doc: DocumentData = serde_json::from_value(raw).unwrap();
        assert_eq!(doc.root_id, "page");
        assert_eq!(doc.blocks[&BlockId::from("page")].first_child, Some(BlockId::from("a")));
    }
}
