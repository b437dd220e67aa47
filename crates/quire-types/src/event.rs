//! Remote change notifications.
//!
//! The remote store publishes a flat feed of table changes. `path[0]`
//! names the table: `"blocks"` for the block table (one row per block), and
//! `"children"` for the child-order table (one ordered id array per parent).
//! `value` is a JSON string so a malformed row can be detected and dropped
//! without poisoning the whole feed.

use serde::{Deserialize, Serialize};
use strum::EnumString;

/// Table name of block rows.
pub const BLOCK_TABLE: &str = "blocks";

/// Table name of child-order rows.
pub const CHILDREN_TABLE: &str = "children";

/// What happened to the row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum RemoteCommand {
    Inserted,
    Updated,
    Deleted,
}

/// One remote change notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    pub path: Vec<String>,
    pub id: String,
    /// JSON-encoded row value (absent for deletions).
    #[serde(default)]
    pub value: Option<String>,
    pub command: RemoteCommand,
}

impl RemoteEvent {
    pub fn new(path: Vec<String>, id: impl Into<String>, value: Option<String>, command: RemoteCommand) -> Self {
        Self {
            path,
            id: id.into(),
            value,
            command,
        }
    }

    /// Whether this event targets the block table.
    pub fn is_block_table(&self) -> bool {
        self.path.first().map(String::as_str) == Some(BLOCK_TABLE)
    }

    /// Whether this event targets the child-order table.
    pub fn is_children_table(&self) -> bool {
        self.path.first().map(String::as_str) == Some(CHILDREN_TABLE)
    }

    /// Field path inside the row, when the event addresses a nested field
    /// (`["blocks", <id>, "data", ...]` → `["data", ...]`).
    pub fn field_path(&self) -> &[String] {
        self.path.get(2..).unwrap_or(&[])
    }
}
