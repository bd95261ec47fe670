//! Timestamp ledger: ordered record of in-flight compressed units.
//!
//! Every compressed unit pushed into the bitstream FIFO leaves one entry
//! here, `(timestamp, fifo offset)`. When the engine later reports a decoded
//! picture it gives back an approximate FIFO offset, and the ledger resolves
//! it to the timestamp of the unit that produced the picture.
//!
//! The list is touched by both the interrupt bottom half and the submission
//! worker, so it lives behind a single mutex. The pending-unit counter sits
//! next to it as a lock-free atomic: it is advisory (used for drain and
//! end-of-stream decisions), never for matching.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use vdec_common::LedgerError;

/// Offsets reported by the engine differ slightly from the submitted ones.
/// 4 KiB is the minimum packet size, so two distinct units can never fall
/// inside the same window.
pub const OFFSET_TOLERANCE: i32 = 4096;

/// One in-flight compressed unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimestampEntry {
    /// Presentation timestamp handed back with the decoded picture.
    pub timestamp: u64,
    /// FIFO offset the unit was written at.
    pub offset: i32,
}

/// Result of [`TimestampLedger::match_by_offset`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct OffsetMatch {
    /// Timestamp of the matched entry, if any.
    pub timestamp: Option<u64>,
    /// Stale entries dropped during the scan.
    pub evicted: usize,
}

/// Ordered, lock-protected timestamp list plus the pending-unit counter.
#[derive(Debug, Default)]
pub struct TimestampLedger {
    entries: Mutex<VecDeque<TimestampEntry>>,
    pending: AtomicI32,
}

impl TimestampLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a submitted unit.
    ///
    /// The entry goes in front of the first entry with a strictly greater
    /// timestamp; equal timestamps keep submission order.
    pub fn insert(&self, timestamp: u64, offset: i32) {
        let entry = TimestampEntry { timestamp, offset };
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| timestamp < e.timestamp) {
            Some(pos) => entries.insert(pos, entry),
            None => entries.push_back(entry),
        }
    }

    /// Remove the entry carrying exactly `timestamp`.
    ///
    /// A miss is expected when buffers come back out of matching order; it
    /// is logged and the ledger is left untouched.
    pub fn remove_by_timestamp(&self, timestamp: u64) -> Result<TimestampEntry, LedgerError> {
        let mut entries = self.entries.lock();
        match entries.iter().position(|e| e.timestamp == timestamp) {
            Some(pos) => entries.remove(pos).ok_or(LedgerError::NotFound(timestamp)),
            None => {
                warn!(
                    timestamp,
                    "Couldn't remove buffer with timestamp from list"
                );
                Err(LedgerError::NotFound(timestamp))
            }
        }
    }

    /// Discard the head entry and account for it in the pending counter.
    ///
    /// Used when the engine completed a buffer the host cannot identify, to
    /// keep the ledger length in step with the engine.
    pub fn remove_oldest(&self) -> Result<TimestampEntry, LedgerError> {
        let mut entries = self.entries.lock();
        match entries.pop_front() {
            Some(entry) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Ok(entry)
            }
            None => {
                error!("Can't rm first timestamp: list empty");
                Err(LedgerError::Empty)
            }
        }
    }

    /// Pop the head entry for a completion. The pending counter is settled
    /// by the completion itself.
    pub fn take_oldest(&self) -> Option<TimestampEntry> {
        self.entries.lock().pop_front()
    }

    /// Resolve an engine-reported FIFO offset to a timestamp.
    ///
    /// Scans from the head. The first entry within [`OFFSET_TOLERANCE`] is
    /// removed and returned. On the way, entries that lie before the target
    /// (units that produced no picture) or so far after it that the FIFO
    /// must have wrapped are evicted, each decrementing the pending counter.
    /// Anything else is kept for a later report.
    pub fn match_by_offset(&self, offset: i32, fifo_size: u32) -> OffsetMatch {
        let fifo = fifo_size as i32;
        // Engine offsets do not wrap around the FIFO size on their own.
        let offset = offset % fifo;
        let wrap_limit = -(fifo / 2);

        let mut result = OffsetMatch::default();
        let mut entries = self.entries.lock();
        let mut i = 0;
        while i < entries.len() {
            let entry = entries[i];
            let delta = offset.wrapping_sub(entry.offset);

            if delta > -OFFSET_TOLERANCE && delta < OFFSET_TOLERANCE {
                entries.remove(i);
                result.timestamp = Some(entry.timestamp);
                break;
            }

            if delta > 0 || delta < wrap_limit {
                debug!(
                    timestamp = entry.timestamp,
                    entry_offset = entry.offset,
                    offset,
                    "Evicting stale timestamp"
                );
                entries.remove(i);
                self.pending.fetch_sub(1, Ordering::AcqRel);
                result.evicted += 1;
                continue;
            }

            i += 1;
        }

        result
    }

    /// Count one more unit handed to the engine.
    pub fn note_submitted(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Count one unit fully completed.
    pub fn note_completed(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    /// Units submitted but not yet completed or evicted.
    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of the current entries, head first. Diagnostics only.
    pub fn snapshot(&self) -> Vec<TimestampEntry> {
        self.entries.lock().iter().copied().collect()
    }

    /// Drop every entry and zero the counter (session teardown).
    pub fn clear(&self) {
        self.entries.lock().clear();
        self.pending.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timestamps(ledger: &TimestampLedger) -> Vec<u64> {
        ledger.snapshot().iter().map(|e| e.timestamp).collect()
    }

    fn submit(ledger: &TimestampLedger, ts: u64, offset: i32) {
        ledger.insert(ts, offset);
        ledger.note_submitted();
    }

    #[test]
    fn increasing_inserts_keep_order() {
        let ledger = TimestampLedger::new();
        for (i, ts) in [10u64, 20, 30, 40].iter().enumerate() {
            ledger.insert(*ts, i as i32 * 5000);
        }
        assert_eq!(timestamps(&ledger), vec![10, 20, 30, 40]);
    }

    #[test]
    fn out_of_order_insert_is_sorted() {
        let ledger = TimestampLedger::new();
        ledger.insert(30, 0);
        ledger.insert(10, 5000);
        ledger.insert(20, 10000);
        ledger.insert(40, 15000);
        assert_eq!(timestamps(&ledger), vec![10, 20, 30, 40]);
    }

    #[test]
    fn equal_timestamps_keep_submission_order() {
        let ledger = TimestampLedger::new();
        ledger.insert(10, 0);
        ledger.insert(10, 5000);
        let offsets: Vec<i32> = ledger.snapshot().iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 5000]);
    }

    #[test]
    fn remove_by_timestamp_miss_leaves_ledger_alone() {
        let ledger = TimestampLedger::new();
        assert_eq!(ledger.remove_by_timestamp(5), Err(LedgerError::NotFound(5)));

        ledger.insert(1, 0);
        ledger.insert(2, 5000);
        assert_eq!(ledger.remove_by_timestamp(3), Err(LedgerError::NotFound(3)));
        assert_eq!(timestamps(&ledger), vec![1, 2]);

        let removed = ledger.remove_by_timestamp(2).unwrap();
        assert_eq!(removed.offset, 5000);
        assert_eq!(timestamps(&ledger), vec![1]);
    }

    #[test]
    fn remove_oldest_on_empty_reports_error() {
        let ledger = TimestampLedger::new();
        assert_eq!(ledger.remove_oldest(), Err(LedgerError::Empty));
        assert_eq!(ledger.pending(), 0);
    }

    #[test]
    fn remove_oldest_decrements_pending() {
        let ledger = TimestampLedger::new();
        submit(&ledger, 1, 0);
        submit(&ledger, 2, 5000);
        assert_eq!(ledger.remove_oldest().unwrap().timestamp, 1);
        assert_eq!(ledger.pending(), 1);
    }

    #[test]
    fn take_oldest_leaves_pending_alone() {
        let ledger = TimestampLedger::new();
        submit(&ledger, 1, 0);
        assert_eq!(ledger.take_oldest().unwrap().timestamp, 1);
        assert_eq!(ledger.pending(), 1);
        assert!(ledger.take_oldest().is_none());
    }

    #[test]
    fn match_within_tolerance() {
        let ledger = TimestampLedger::new();
        submit(&ledger, 100, 20000);

        let m = ledger.match_by_offset(20000 + OFFSET_TOLERANCE - 1, 1 << 20);
        assert_eq!(m.timestamp, Some(100));
        assert_eq!(m.evicted, 0);
        assert!(ledger.is_empty());
        // The match itself is settled by the completion, not the ledger.
        assert_eq!(ledger.pending(), 1);
    }

    #[test]
    fn never_matches_outside_window() {
        let ledger = TimestampLedger::new();
        submit(&ledger, 100, 20000);

        // Target exactly one tolerance ahead of the entry: stale, evicted.
        let m = ledger.match_by_offset(20000 + OFFSET_TOLERANCE, 1 << 20);
        assert_eq!(m.timestamp, None);
        assert_eq!(m.evicted, 1);

        // Target one tolerance behind the entry: kept for later.
        submit(&ledger, 200, 40000);
        let m = ledger.match_by_offset(40000 - OFFSET_TOLERANCE, 1 << 20);
        assert_eq!(m, OffsetMatch::default());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn stale_entries_before_target_are_evicted() {
        let ledger = TimestampLedger::new();
        submit(&ledger, 1, 0);
        submit(&ledger, 2, 10000);
        submit(&ledger, 3, 20000);
        submit(&ledger, 4, 30000);

        let m = ledger.match_by_offset(20100, 1 << 20);
        assert_eq!(m.timestamp, Some(3));
        assert_eq!(m.evicted, 2);
        assert_eq!(ledger.pending(), 2);
        assert_eq!(timestamps(&ledger), vec![4]);
    }

    #[test]
    fn wrapped_entries_are_evicted_without_match() {
        let fifo = 100_000;
        let ledger = TimestampLedger::new();
        submit(&ledger, 1, 90000);
        submit(&ledger, 2, 30000);

        // 200 - 90000 is past half the FIFO: the unit at 90000 is gone.
        // 200 - 30000 is behind but within half the FIFO: kept.
        let m = ledger.match_by_offset(200, fifo);
        assert_eq!(m.timestamp, None);
        assert_eq!(m.evicted, 1);
        assert_eq!(ledger.pending(), 1);
        assert_eq!(timestamps(&ledger), vec![2]);
    }

    #[test]
    fn reported_offset_is_reduced_modulo_fifo() {
        let fifo = 100_000;
        let ledger = TimestampLedger::new();
        submit(&ledger, 7, 1000);
        let m = ledger.match_by_offset(fifo as i32 * 3 + 1200, fifo);
        assert_eq!(m.timestamp, Some(7));
    }

    #[test]
    fn concurrent_inserts_stay_sorted() {
        use std::sync::Arc;
        use std::thread;

        let ledger = Arc::new(TimestampLedger::new());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    for i in 0..50u64 {
                        let ts = i * 4 + t;
                        ledger.insert(ts, (ts * 4096) as i32);
                        ledger.note_submitted();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let ts = timestamps(&ledger);
        assert_eq!(ts.len(), 200);
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(ledger.pending(), 200);
    }
}
