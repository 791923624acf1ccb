//! Counters for process-array traffic and visibility lookups.
//!
//! Every counter is a relaxed atomic owned by one [`crate::ProcArray`];
//! recording never blocks and never takes the array lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// How an `is_in_progress` lookup was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupOutcome {
    /// Older than the caller's RecentXmin.
    ByRecentXmin,
    /// Commit log already knew the outcome.
    ByKnownCompleted,
    /// The caller's own transaction or subtransaction.
    ByMyXact,
    /// Newer than the latest completed watermark.
    ByLatestXid,
    /// Matched a top-level xid during the scan.
    ByMainXid,
    /// Matched a cached subtransaction id during the scan.
    ByChildXid,
    /// Not found and no cache had overflowed.
    NoOverflow,
    /// Needed the commit log and ancestry fallback.
    SlowAnswer,
}

/// Live counters.
#[derive(Debug, Default)]
pub struct ProcArrayStats {
    shared_locks: AtomicU64,
    exclusive_locks: AtomicU64,
    by_recent_xmin: AtomicU64,
    by_known_completed: AtomicU64,
    by_my_xact: AtomicU64,
    by_latest_xid: AtomicU64,
    by_main_xid: AtomicU64,
    by_child_xid: AtomicU64,
    no_overflow: AtomicU64,
    slow_answer: AtomicU64,
    snapshots_built: AtomicU64,
    snapshots_overflowed: AtomicU64,
}

/// Point-in-time copy of [`ProcArrayStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProcArrayStatsSnapshot {
    pub shared_locks: u64,
    pub exclusive_locks: u64,
    pub by_recent_xmin: u64,
    pub by_known_completed: u64,
    pub by_my_xact: u64,
    pub by_latest_xid: u64,
    pub by_main_xid: u64,
    pub by_child_xid: u64,
    pub no_overflow: u64,
    pub slow_answer: u64,
    pub snapshots_built: u64,
    pub snapshots_overflowed: u64,
}

impl ProcArrayStatsSnapshot {
    /// Total `is_in_progress` lookups answered.
    #[must_use]
    pub const fn lookups(&self) -> u64 {
        self.by_recent_xmin
            + self.by_known_completed
            + self.by_my_xact
            + self.by_latest_xid
            + self.by_main_xid
            + self.by_child_xid
            + self.no_overflow
            + self.slow_answer
    }

    /// Lock acquisitions of either mode.
    #[must_use]
    pub const fn lock_acquisitions(&self) -> u64 {
        self.shared_locks + self.exclusive_locks
    }
}

impl ProcArrayStats {
    #[inline]
    pub(crate) fn record_shared_lock(&self) {
        self.shared_locks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_exclusive_lock(&self) {
        self.exclusive_locks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_lookup(&self, outcome: LookupOutcome) {
        let counter = match outcome {
            LookupOutcome::ByRecentXmin => &self.by_recent_xmin,
            LookupOutcome::ByKnownCompleted => &self.by_known_completed,
            LookupOutcome::ByMyXact => &self.by_my_xact,
            LookupOutcome::ByLatestXid => &self.by_latest_xid,
            LookupOutcome::ByMainXid => &self.by_main_xid,
            LookupOutcome::ByChildXid => &self.by_child_xid,
            LookupOutcome::NoOverflow => &self.no_overflow,
            LookupOutcome::SlowAnswer => &self.slow_answer,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_snapshot(&self, overflowed: bool) {
        self.snapshots_built.fetch_add(1, Ordering::Relaxed);
        if overflowed {
            self.snapshots_overflowed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Copy every counter.
    #[must_use]
    pub fn snapshot(&self) -> ProcArrayStatsSnapshot {
        ProcArrayStatsSnapshot {
            shared_locks: self.shared_locks.load(Ordering::Relaxed),
            exclusive_locks: self.exclusive_locks.load(Ordering::Relaxed),
            by_recent_xmin: self.by_recent_xmin.load(Ordering::Relaxed),
            by_known_completed: self.by_known_completed.load(Ordering::Relaxed),
            by_my_xact: self.by_my_xact.load(Ordering::Relaxed),
            by_latest_xid: self.by_latest_xid.load(Ordering::Relaxed),
            by_main_xid: self.by_main_xid.load(Ordering::Relaxed),
            by_child_xid: self.by_child_xid.load(Ordering::Relaxed),
            no_overflow: self.no_overflow.load(Ordering::Relaxed),
            slow_answer: self.slow_answer.load(Ordering::Relaxed),
            snapshots_built: self.snapshots_built.load(Ordering::Relaxed),
            snapshots_overflowed: self.snapshots_overflowed.load(Ordering::Relaxed),
        }
    }

    /// Emit the lookup counters at debug level.
    pub fn log_summary(&self) {
        let s = self.snapshot();
        tracing::debug!(
            lookups = s.lookups(),
            by_recent_xmin = s.by_recent_xmin,
            by_known_completed = s.by_known_completed,
            by_my_xact = s.by_my_xact,
            by_latest_xid = s.by_latest_xid,
            by_main_xid = s.by_main_xid,
            by_child_xid = s.by_child_xid,
            no_overflow = s.no_overflow,
            slow_answer = s.slow_answer,
            snapshots_built = s.snapshots_built,
            "proc array lookup statistics"
        );
    }
}
