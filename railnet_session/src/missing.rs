// Missing-train reconciliation counters.
//
// Clients count, per train number, how many consecutive `Move` entries
// referenced a train they have no replica of (or whose car count disagrees
// with the replica). When a counter reaches the threshold the caller sends a
// single `GetTrain` and the counter starts over, so a train that stays
// missing is re-requested at most once per threshold references.

use std::collections::BTreeMap;

use railnet_protocol::TrainNumber;

/// Default number of consecutive misses that triggers a `GetTrain`.
pub const DEFAULT_MISSING_THRESHOLD: u32 = 10;

#[derive(Debug)]
pub struct MissingCounters {
    threshold: u32,
    counts: BTreeMap<TrainNumber, u32>,
}

impl MissingCounters {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counts: BTreeMap::new(),
        }
    }

    /// Count one miss. Returns true exactly when the threshold is reached,
    /// in which case the counter is reset.
    pub fn record(&mut self, number: TrainNumber) -> bool {
        let count = self.counts.entry(number).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            self.counts.remove(&number);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self, number: TrainNumber) {
        self.counts.remove(&number);
    }

    pub fn count(&self, number: TrainNumber) -> u32 {
        self.counts.get(&number).copied().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.counts.clear();
    }
}

impl Default for MissingCounters {
    fn default() -> Self {
        Self::new(DEFAULT_MISSING_THRESHOLD)
    }
}
