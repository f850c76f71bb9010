//! Recovered-transaction bookkeeping (spec §3 "Recovered-transaction
//! record", §4.F "Scan orchestration" mode 1).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::wal::lsn::{Lsn, WalSegmentName};

/// One candidate transaction surfaced by the discovery pass: everything
/// the user needs to decide whether to restore it.
#[derive(Debug, Clone)]
pub struct RecoveredTransaction {
    pub xid: u32,
    pub commit_time: DateTime<Utc>,
    pub start_lsn: Lsn,
    pub start_segment: WalSegmentName,
    pub end_lsn: Lsn,
    pub end_segment: WalSegmentName,
    pub relfilenodes: Vec<u32>,
    pub tuple_count: u64,
}

/// Accumulates per-xid state as the discovery pass observes heap records
/// (before the commit record resolves which xid they belonged to) and
/// the commit record that closes them out.
#[derive(Debug, Default)]
pub struct TransactionTracker {
    open: BTreeMap<u32, OpenTransaction>,
    closed: Vec<RecoveredTransaction>,
}

#[derive(Debug, Clone)]
struct OpenTransaction {
    start_lsn: Lsn,
    start_segment: WalSegmentName,
    end_lsn: Lsn,
    end_segment: WalSegmentName,
    relfilenodes: Vec<u32>,
    tuple_count: u64,
}

impl TransactionTracker {
    pub fn new() -> Self {
        TransactionTracker::default()
    }

    /// Note that `xid` touched `filenode` at `lsn` (widens the xid's LSN
    /// span and records the filenode if new).
    pub fn observe_touch(&mut self, xid: u32, lsn: Lsn, segment: WalSegmentName, filenode: Option<u32>) {
        let entry = self.open.entry(xid).or_insert_with(|| OpenTransaction {
            start_lsn: lsn,
            start_segment: segment,
            end_lsn: lsn,
            end_segment: segment,
            relfilenodes: Vec::new(),
            tuple_count: 0,
        });
        if lsn < entry.start_lsn {
            entry.start_lsn = lsn;
            entry.start_segment = segment;
        }
        if lsn > entry.end_lsn {
            entry.end_lsn = lsn;
            entry.end_segment = segment;
        }
        if let Some(f) = filenode {
            if !entry.relfilenodes.contains(&f) {
                entry.relfilenodes.push(f);
            }
        }
        entry.tuple_count += 1;
    }

    /// Close out `xid` on its commit record, moving it from open to
    /// closed and merging in the relfilenodes the commit record itself
    /// carries (spec §3: a commit lists the relations it touched).
    pub fn observe_commit(&mut self, xid: u32, commit_time: DateTime<Utc>, lsn: Lsn, segment: WalSegmentName, commit_relfilenodes: &[u32]) {
        let mut entry = self.open.remove(&xid).unwrap_or_else(|| OpenTransaction {
            start_lsn: lsn,
            start_segment: segment,
            end_lsn: lsn,
            end_segment: segment,
            relfilenodes: Vec::new(),
            tuple_count: 0,
        });
        if lsn > entry.end_lsn {
            entry.end_lsn = lsn;
            entry.end_segment = segment;
        }
        for f in commit_relfilenodes {
            if !entry.relfilenodes.contains(f) {
                entry.relfilenodes.push(*f);
            }
        }
        self.closed.push(RecoveredTransaction {
            xid,
            commit_time,
            start_lsn: entry.start_lsn,
            start_segment: entry.start_segment,
            end_lsn: entry.end_lsn,
            end_segment: entry.end_segment,
            relfilenodes: entry.relfilenodes,
            tuple_count: entry.tuple_count,
        });
    }

    /// Drain the committed transactions observed so far, in commit order.
    pub fn into_transactions(self) -> Vec<RecoveredTransaction> {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg() -> WalSegmentName {
        WalSegmentName { timeline: 1, log: 0, seg: 0 }
    }

    #[test]
    fn widens_lsn_span_across_touches_and_closes_on_commit() {
        let mut tracker = TransactionTracker::new();
        tracker.observe_touch(42, Lsn(100), seg(), Some(16384));
        tracker.observe_touch(42, Lsn(200), seg(), Some(16385));
        tracker.observe_commit(42, Utc::now(), Lsn(250), seg(), &[16384]);

        let txns = tracker.into_transactions();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].start_lsn, Lsn(100));
        assert_eq!(txns[0].end_lsn, Lsn(250));
        assert_eq!(txns[0].tuple_count, 2);
        assert!(txns[0].relfilenodes.contains(&16384));
        assert!(txns[0].relfilenodes.contains(&16385));
    }

    #[test]
    fn commit_with_no_prior_touches_still_closes() {
        let mut tracker = TransactionTracker::new();
        tracker.observe_commit(7, Utc::now(), Lsn(50), seg(), &[1]);
        let txns = tracker.into_transactions();
        assert_eq!(txns.len(), 1);
        assert_eq!(txns[0].tuple_count, 0);
    }
}
