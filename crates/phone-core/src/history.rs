use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::CallRecord;

/// Default bounded capacity of the call history.
pub const DEFAULT_HISTORY_CAPACITY: usize = 500;

/// Evictions are logged in batches of this size rather than one by one.
const EVICTION_LOG_BATCH: u64 = 100;

/// Filter applied by [`HistoryLedger::export`] and [`HistoryLedger::prune`].
///
/// `older_than` is applied first (receiver timestamps at or before the cutoff
/// go), then `keep_last` caps what remains.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct HistoryFilter {
    /// Receiver wall-clock cutoff (seconds since Unix epoch).
    pub older_than: Option<f64>,
    /// Maximum number of newest records to keep/return.
    pub keep_last: Option<usize>,
}

/// Bounded, ordered record of finalized call outcomes.
///
/// Newest-last internally; capacity overflow evicts oldest. Export never
/// mutates; prune and clear do.
#[derive(Debug, Clone)]
pub struct HistoryLedger {
    records: VecDeque<CallRecord>,
    capacity: usize,
    evictions: u64,
}

impl Default for HistoryLedger {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl HistoryLedger {
    /// Create a ledger with the given capacity (`capacity >= 1`).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
            evictions: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Most recently appended record.
    pub fn latest(&self) -> Option<&CallRecord> {
        self.records.back()
    }

    /// Append a finalized record, evicting the oldest past capacity.
    pub fn append(&mut self, record: CallRecord) {
        self.records.push_back(record);
        while self.records.len() > self.capacity {
            self.records.pop_front();
            self.evictions += 1;
            if self.evictions % EVICTION_LOG_BATCH == 0 {
                debug!(
                    evictions = self.evictions,
                    capacity = self.capacity,
                    "call history capacity evictions"
                );
            }
        }
    }

    /// Export matching records, newest-first. Does not mutate the ledger.
    pub fn export(&self, filter: HistoryFilter) -> Vec<CallRecord> {
        let mut matching: Vec<&CallRecord> = self
            .records
            .iter()
            .filter(|record| keeps(record, filter.older_than))
            .collect();
        if let Some(keep_last) = filter.keep_last {
            let excess = matching.len().saturating_sub(keep_last);
            matching.drain(0..excess);
        }
        matching.into_iter().rev().cloned().collect()
    }

    /// Remove records matching the filter semantics, returning how many were
    /// removed. An empty filter clears everything.
    pub fn prune(&mut self, filter: HistoryFilter) -> usize {
        let before = self.records.len();

        if filter.older_than.is_none() && filter.keep_last.is_none() {
            self.records.clear();
            return before;
        }

        if let Some(cutoff) = filter.older_than {
            self.records.retain(|record| keeps(record, Some(cutoff)));
        }
        if let Some(keep_last) = filter.keep_last {
            while self.records.len() > keep_last {
                self.records.pop_front();
            }
        }

        before - self.records.len()
    }
}

fn keeps(record: &CallRecord, older_than: Option<f64>) -> bool {
    match older_than {
        Some(cutoff) => record.received_ts > cutoff,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CallKind;

    fn record(seq: u64, received_ts: f64) -> CallRecord {
        CallRecord {
            ts_device: seq as i64,
            received_ts,
            seq,
            kind: CallKind::Incoming,
            number: format!("55{seq}"),
            duration_s: Some(10),
            reason: None,
            synthetic: false,
        }
    }

    #[test]
    fn appending_past_capacity_evicts_oldest() {
        let mut ledger = HistoryLedger::with_capacity(500);
        for seq in 1..=501 {
            ledger.append(record(seq, seq as f64));
        }
        assert_eq!(ledger.len(), 500);
        let exported = ledger.export(HistoryFilter::default());
        assert_eq!(exported.len(), 500);
        // Newest-first, and the record with seq 1 was evicted.
        assert_eq!(exported[0].seq, 501);
        assert_eq!(exported[499].seq, 2);
    }

    #[test]
    fn export_is_newest_first_and_does_not_mutate() {
        let mut ledger = HistoryLedger::with_capacity(10);
        for seq in 1..=3 {
            ledger.append(record(seq, seq as f64));
        }
        let exported = ledger.export(HistoryFilter::default());
        assert_eq!(
            exported.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn export_applies_older_than_then_keep_last() {
        let mut ledger = HistoryLedger::with_capacity(10);
        for seq in 1..=6 {
            ledger.append(record(seq, seq as f64));
        }

        let exported = ledger.export(HistoryFilter {
            older_than: Some(2.0),
            keep_last: Some(3),
        });
        assert_eq!(
            exported.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![6, 5, 4]
        );
        assert!(exported.iter().all(|r| r.received_ts > 2.0));
    }

    #[test]
    fn prune_never_leaves_more_than_keep_last_or_older_than_cutoff() {
        let mut ledger = HistoryLedger::with_capacity(20);
        for seq in 1..=10 {
            ledger.append(record(seq, seq as f64));
        }

        let removed = ledger.prune(HistoryFilter {
            older_than: Some(4.0),
            keep_last: Some(3),
        });
        assert_eq!(removed, 7);
        let remaining = ledger.export(HistoryFilter::default());
        assert_eq!(
            remaining.iter().map(|r| r.seq).collect::<Vec<_>>(),
            vec![10, 9, 8]
        );
    }

    #[test]
    fn empty_prune_filter_clears_everything() {
        let mut ledger = HistoryLedger::with_capacity(10);
        for seq in 1..=4 {
            ledger.append(record(seq, seq as f64));
        }
        assert_eq!(ledger.prune(HistoryFilter::default()), 4);
        assert!(ledger.is_empty());
    }

    #[test]
    fn latest_tracks_most_recent_append() {
        let mut ledger = HistoryLedger::default();
        assert!(ledger.latest().is_none());
        ledger.append(record(1, 1.0));
        ledger.append(record(2, 2.0));
        assert_eq!(ledger.latest().map(|r| r.seq), Some(2));
    }
}
