//! Rolling in-memory history of register readings.

use chrono::{DateTime, TimeDelta, Utc};
use hydrobridge_common::{HistoryEntry, Value};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::debug;

use crate::error::{Dx2wError, Result};

/// Hours of history retained for every register.
pub const RETENTION_HOURS: i64 = 24;

/// Retention window as a duration.
pub fn retention() -> TimeDelta {
    TimeDelta::hours(RETENTION_HOURS)
}

/// Serialized form of the store: register name → entries, oldest first.
pub type HistoryMap = BTreeMap<String, Vec<HistoryEntry>>;

/// Per-register append-only log, pruned to the retention window.
///
/// A single coarse lock guards the whole map. Queries take the shared side and
/// return copies; appends take the exclusive side for one push and one prune.
#[derive(Debug, Default)]
pub struct HistoryStore {
    entries: RwLock<HashMap<String, Vec<HistoryEntry>>>,
}

impl HistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reading.
    ///
    /// On error the previous value (if any) is carried forward and the error
    /// message stored, so the tick is never dropped. The entry is inserted in
    /// timestamp order; entries older than the retention window are pruned
    /// afterwards.
    pub fn append(
        &self,
        name: &str,
        timestamp: DateTime<Utc>,
        reading: Result<Value>,
    ) -> HistoryEntry {
        let mut map = self.entries.write();
        let log = map.entry(name.to_string()).or_default();

        // Keep the log ordered even if the clock steps back.
        let idx = log.partition_point(|e| e.timestamp <= timestamp);
        let entry = match reading {
            Ok(value) => HistoryEntry::ok(value).at(timestamp),
            Err(e) => {
                let previous = log[..idx].last().and_then(|last| last.value);
                HistoryEntry::carried(previous, e.to_string()).at(timestamp)
            }
        };
        log.insert(idx, entry.clone());

        let pruned = prune(log, Utc::now() - retention());
        if pruned > 0 {
            debug!(register = %name, pruned, "Pruned expired history entries");
        }

        entry
    }

    /// Replace the whole content, e.g. from a snapshot. Expired entries are
    /// dropped on the way in.
    pub fn restore(&self, history: HistoryMap) {
        let cutoff = Utc::now() - retention();
        let mut restored = HashMap::with_capacity(history.len());
        for (name, mut log) in history {
            log.sort_by_key(|e| e.timestamp);
            prune(&mut log, cutoff);
            if !log.is_empty() {
                restored.insert(name, log);
            }
        }
        *self.entries.write() = restored;
    }

    /// Copy of the whole store.
    pub fn snapshot(&self) -> HistoryMap {
        self.entries
            .read()
            .iter()
            .map(|(name, log)| (name.clone(), log.clone()))
            .collect()
    }

    /// All retained entries for a register, oldest first.
    pub fn list_all(&self, name: &str) -> Vec<HistoryEntry> {
        self.entries.read().get(name).cloned().unwrap_or_default()
    }

    /// Most recent entry for a register.
    pub fn latest(&self, name: &str) -> Option<HistoryEntry> {
        self.entries
            .read()
            .get(name)
            .and_then(|log| log.last().cloned())
    }

    /// Most recent entry for every register with history.
    pub fn latest_all(&self) -> BTreeMap<String, HistoryEntry> {
        self.entries
            .read()
            .iter()
            .filter_map(|(name, log)| log.last().map(|e| (name.clone(), e.clone())))
            .collect()
    }

    /// Number of registers with at least one entry.
    pub fn register_count(&self) -> usize {
        self.entries.read().len()
    }

    /// Total number of retained entries across all registers.
    pub fn total_entries(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    /// Mean of the numeric values recorded within `interval`.
    pub fn mean(&self, name: &str, interval: Duration) -> Result<f64> {
        let nums = self.numeric_window(name, interval)?;
        Ok(nums.iter().sum::<f64>() / nums.len() as f64)
    }

    /// Median of the numeric values recorded within `interval`.
    pub fn median(&self, name: &str, interval: Duration) -> Result<f64> {
        let mut nums = self.numeric_window(name, interval)?;
        nums.sort_by(f64::total_cmp);

        let mid = nums.len() / 2;
        if nums.len() % 2 == 0 {
            Ok((nums[mid - 1] + nums[mid]) / 2.0)
        } else {
            Ok(nums[mid])
        }
    }

    /// Percentage (0-100) of readings within `interval` that were "on".
    pub fn percent_on(&self, name: &str, interval: Duration) -> Result<f64> {
        let values = self.window(name, interval);
        if values.is_empty() {
            return Err(no_data(name, interval));
        }

        let on = values.iter().filter(|v| v.is_on()).count();
        Ok(on as f64 / values.len() as f64 * 100.0)
    }

    /// Error-free values recorded in `[now - interval, now]`.
    fn window(&self, name: &str, interval: Duration) -> Vec<Value> {
        let now = Utc::now();
        let cutoff = TimeDelta::from_std(interval)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let map = self.entries.read();
        let Some(log) = map.get(name) else {
            return Vec::new();
        };

        log.iter()
            .filter(|e| e.timestamp >= cutoff && e.timestamp <= now && e.is_ok())
            .filter_map(|e| e.value)
            .collect()
    }

    fn numeric_window(&self, name: &str, interval: Duration) -> Result<Vec<f64>> {
        let nums: Vec<f64> = self
            .window(name, interval)
            .iter()
            .filter_map(Value::numeric)
            .collect();
        if nums.is_empty() {
            return Err(no_data(name, interval));
        }
        Ok(nums)
    }
}

/// Drop entries older than `cutoff` from an ordered log.
fn prune(log: &mut Vec<HistoryEntry>, cutoff: DateTime<Utc>) -> usize {
    let idx = log.partition_point(|e| e.timestamp < cutoff);
    log.drain(..idx);
    idx
}

fn no_data(name: &str, interval: Duration) -> Dx2wError {
    Dx2wError::NoData {
        register: name.to_string(),
        interval_secs: interval.as_secs(),
    }
}
