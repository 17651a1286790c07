use crate::error::{DebugError, Result};
use crate::parser::RegisterSnapshot;
use crate::target::Target;
use tracing::{debug, trace};

/// Replay cursor over the target's trace log.
///
/// `visited[k]` is trace entry `k` (0 = most recent). `position` counts the
/// steps taken back from the live edge, so the cursor sits on
/// `visited[position - 1]` while historical. Entries are fetched once and kept
/// until `clear`, which makes walking forward and back again free.
#[derive(Debug, Default)]
pub struct HistoryCursor {
    visited: Vec<RegisterSnapshot>,
    position: usize,
    limit: Option<usize>,
    start_reached: bool,
}

impl HistoryCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps how many instructions can be walked back. 0 means unlimited.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: (limit > 0).then_some(limit),
            ..Self::default()
        }
    }

    pub fn is_historical(&self) -> bool {
        self.position > 0
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// The snapshot the cursor is on, `None` at the live edge.
    pub fn current(&self) -> Option<&RegisterSnapshot> {
        self.position.checked_sub(1).and_then(|i| self.visited.get(i))
    }

    /// PCs of every fetched entry, most recent first.
    pub fn visited_addresses(&self) -> Vec<u16> {
        self.visited.iter().map(|s| s.pc).collect()
    }

    /// One instruction further into the past.
    ///
    /// Returns `Ok(None)` at the start of the recorded history. A failed fetch
    /// leaves the cursor where it was.
    pub fn step_back(&mut self, target: &mut dyn Target) -> Result<Option<RegisterSnapshot>> {
        if let Some(limit) = self.limit {
            if self.position >= limit {
                debug!(limit, "history size limit reached");
                return Ok(None);
            }
        }
        if let Some(snapshot) = self.visited.get(self.position).copied() {
            self.position += 1;
            trace!(position = self.position, pc = snapshot.pc, "history cache hit");
            return Ok(Some(snapshot));
        }
        if self.start_reached {
            return Ok(None);
        }

        let index = self.position;
        match target.fetch_snapshot(index) {
            Ok(Some(mut snapshot)) => {
                snapshot.position = Some(index);
                self.visited.push(snapshot);
                self.position += 1;
                debug!(index, pc = snapshot.pc, "fetched history entry");
                Ok(Some(snapshot))
            }
            Ok(None) => {
                debug!(index, "start of recorded history");
                self.start_reached = true;
                Ok(None)
            }
            Err(e) => Err(DebugError::HistoryUnavailable(format!(
                "entry {}: {}",
                index, e
            ))),
        }
    }

    /// One instruction towards the live edge. Never talks to the target.
    ///
    /// Returns `None` once the live edge is reached.
    pub fn step_forward(&mut self) -> Option<RegisterSnapshot> {
        if self.position == 0 {
            return None;
        }
        self.position -= 1;
        self.current().copied()
    }

    /// Forgets the history, e.g. once the program runs live again.
    pub fn clear(&mut self) {
        if !self.visited.is_empty() {
            debug!(entries = self.visited.len(), "history cleared");
        }
        self.visited.clear();
        self.position = 0;
        self.start_reached = false;
    }
}
