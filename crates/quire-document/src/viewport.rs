//! Debounced block position tracking.
//!
//! Rendering reports a block's measured rectangle whenever it lays out. The
//! observer holds the newest measurement and commits it to the
//! [`RegionGrid`] once the first uncommitted report is older than the
//! debounce window, so a rectangle in the grid is never staler than that
//! window. Only visible blocks are tracked: a block that scrolls out keeps
//! its last committed rectangle and stops updating until it comes back.

use std::collections::HashMap;
use std::time::Duration;

use quire_types::{BlockId, BlockRect};
use tokio::time::Instant;
use tracing::trace;

use crate::region_grid::RegionGrid;

#[derive(Debug, Default)]
struct Tracked {
    visible: bool,
    /// Newest measurement and when the oldest uncommitted one arrived.
    pending: Option<(BlockRect, Instant)>,
}

/// Visibility-gated, debounced feed from layout into the region grid.
#[derive(Debug)]
pub struct PositionObserver {
    debounce: Duration,
    tracked: HashMap<BlockId, Tracked>,
}

impl PositionObserver {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            tracked: HashMap::new(),
        }
    }

    /// Start tracking a block. It stays hidden until `set_visible`.
    pub fn observe(&mut self, id: BlockId) {
        self.tracked.entry(id).or_default();
    }

    /// Stop tracking a block. Returns whether it was tracked.
    pub fn unobserve(&mut self, id: &BlockId) -> bool {
        self.tracked.remove(id).is_some()
    }

    pub fn is_observed(&self, id: &BlockId) -> bool {
        self.tracked.contains_key(id)
    }

    pub fn is_visible(&self, id: &BlockId) -> bool {
        self.tracked.get(id).is_some_and(|t| t.visible)
    }

    /// Intersection callback. Hiding a block drops its pending measurement.
    pub fn set_visible(&mut self, id: &BlockId, visible: bool) -> bool {
        let Some(tracked) = self.tracked.get_mut(id) else {
            return false;
        };
        tracked.visible = visible;
        if !visible {
            tracked.pending = None;
        }
        true
    }

    /// Record a measurement. Ignored for unobserved or hidden blocks.
    pub fn report_rect(&mut self, rect: BlockRect, now: Instant) -> bool {
        let Some(tracked) = self.tracked.get_mut(&rect.id) else {
            return false;
        };
        if !tracked.visible {
            return false;
        }
        let since = tracked.pending.as_ref().map_or(now, |(_, since)| *since);
        tracked.pending = Some((rect, since));
        true
    }

    /// Drop a pending measurement (the block moved or changed shape).
    pub fn invalidate(&mut self, id: &BlockId) {
        if let Some(tracked) = self.tracked.get_mut(id) {
            tracked.pending = None;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.tracked.values().filter(|t| t.pending.is_some()).count()
    }

    /// Commit measurements whose debounce window has passed. Returns how many
    /// changed the grid.
    pub fn flush_due(&mut self, grid: &mut RegionGrid, now: Instant) -> usize {
        let debounce = self.debounce;
        self.commit(grid, |since| now.saturating_duration_since(since) >= debounce)
    }

    /// Commit every pending measurement regardless of age.
    pub fn flush_all(&mut self, grid: &mut RegionGrid) -> usize {
        self.commit(grid, |_| true)
    }

    fn commit(&mut self, grid: &mut RegionGrid, due: impl Fn(Instant) -> bool) -> usize {
        let mut changed = 0;
        for tracked in self.tracked.values_mut() {
            let ready = tracked.visible && tracked.pending.as_ref().is_some_and(|(_, since)| due(*since));
            if !ready {
                continue;
            }
            if let Some((rect, _)) = tracked.pending.take()
                && grid.update_block(rect)
            {
                changed += 1;
            }
        }
        if changed > 0 {
            trace!("committed {} block rects", changed);
        }
        changed
    }
}
