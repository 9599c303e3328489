use crate::devices::{DeviceKind, MAX_DEVICES};
use chrono::{DateTime, Utc};
use heapless::{FnvIndexMap, Vec};
use serde::{Deserialize, Serialize};

const MAX_RESTART_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartEntry {
    pub id: u32,
    pub kind: DeviceKind,
    pub timestamp: DateTime<Utc>,
}

/// Per-device restart counts for operational reporting. Counts only ever
/// increase during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartRecord {
    counts: FnvIndexMap<DeviceKind, u32, MAX_DEVICES>,
    history: Vec<RestartEntry, MAX_RESTART_HISTORY>,
    next_id: u32,
}

impl RestartRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one restart of `kind` and returns the new count.
    pub fn increment(&mut self, kind: DeviceKind, timestamp: DateTime<Utc>) -> u32 {
        let count = self.count(kind).saturating_add(1);
        // Capacity covers every DeviceKind, so the insert cannot fail.
        let _ = self.counts.insert(kind, count);

        self.next_id = self.next_id.wrapping_add(1);
        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(RestartEntry {
            id: self.next_id,
            kind,
            timestamp,
        });
        count
    }

    pub fn count(&self, kind: DeviceKind) -> u32 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceKind, u32)> + '_ {
        self.counts.iter().map(|(kind, count)| (*kind, *count))
    }

    /// Most recent restarts, oldest first.
    pub fn history(&self) -> &[RestartEntry] {
        &self.history
    }
}
