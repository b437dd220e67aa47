//! Document session configuration.
//!
//! Loaded from a RON file; every field is optional:
//!
//! ```ron
//! (
//!     region_size: 100.0,
//!     text_flush_debounce_ms: 200,
//!     position_debounce_ms: 500,
//!     max_flush_batch: 256,
//! )
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DocumentError;

/// Tunables for one document session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Edge length of one `RegionGrid` cell, in screen units.
    pub region_size: f64,
    /// Coalescing window for text `update` ops.
    pub text_flush_debounce_ms: u64,
    /// How stale a measured block rectangle may get before it is committed.
    pub position_debounce_ms: u64,
    /// Most ops pushed to the remote store per flush.
    pub max_flush_batch: usize,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            region_size: 100.0,
            text_flush_debounce_ms: 200,
            position_debounce_ms: 500,
            max_flush_batch: 256,
        }
    }
}

impl DocumentConfig {
    /// Parse a RON document and validate it.
    pub fn from_ron_str(text: &str) -> Result<Self, DocumentError> {
        let config: DocumentConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a RON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DocumentError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_ron_str(&text)
    }

    pub fn validate(&self) -> Result<(), DocumentError> {
        if !self.region_size.is_finite() || self.region_size <= 0.0 {
            return Err(DocumentError::Config(format!(
                "region_size must be a positive number, got {}",
                self.region_size
            )));
        }
        if self.max_flush_batch == 0 {
            return Err(DocumentError::Config("max_flush_batch must be at least 1".into()));
        }
        Ok(())
    }

    pub fn text_flush_debounce(&self) -> Duration {
        Duration::from_millis(self.text_flush_debounce_ms)
    }

    pub fn position_debounce(&self) -> Duration {
        Duration::from_millis(self.position_debounce_ms)
    }
}
