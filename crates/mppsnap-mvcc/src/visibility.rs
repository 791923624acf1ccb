//! Point visibility queries against the process array.

use std::sync::Arc;

use mppsnap_types::{Snapshot, TransactionId, TransactionRef};

use crate::backend::BackendState;
use crate::distributed;
use crate::observability::LookupOutcome;
use crate::oracle::{CommitLog, SubtransAncestry};
use crate::proc_array::ProcArray;

/// Answers "is this transaction still running" for one node.
pub struct VisibilityOracle {
    procs: Arc<ProcArray>,
    clog: Arc<dyn CommitLog>,
    subtrans: Arc<dyn SubtransAncestry>,
}

impl std::fmt::Debug for VisibilityOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisibilityOracle")
            .field("procs", &self.procs)
            .finish_non_exhaustive()
    }
}

impl VisibilityOracle {
    #[must_use]
    pub fn new(
        procs: Arc<ProcArray>,
        clog: Arc<dyn CommitLog>,
        subtrans: Arc<dyn SubtransAncestry>,
    ) -> Self {
        Self {
            procs,
            clog,
            subtrans,
        }
    }

    #[must_use]
    pub fn procs(&self) -> &Arc<ProcArray> {
        &self.procs
    }

    /// Whether `xid` belongs to a transaction that has not finished yet.
    ///
    /// Cheap checks answer most calls without the lock. Otherwise one shared
    /// scan looks for `xid` as a top-level id or a cached subtransaction id;
    /// if it is in neither and some entry's cache overflowed, the commit log
    /// and the ancestry store settle it after the lock is released.
    pub fn is_in_progress(&self, backend: &mut BackendState, xid: TransactionId) -> bool {
        let stats = self.procs.stats_ref();
        if let Some((answer, outcome)) = self.fast_path(backend, xid) {
            stats.record_lookup(outcome);
            return answer;
        }

        let own = backend.handle();
        let mut overflowed = std::mem::take(&mut backend.scratch);
        overflowed.clear();
        let found = {
            let table = self.procs.read();
            if xid > self.procs.latest_completed() {
                Some(LookupOutcome::ByLatestXid)
            } else {
                let mut found = None;
                for (handle, entry) in table.iter() {
                    if handle == own {
                        continue;
                    }
                    let Some(pxid) = entry.xid else {
                        continue;
                    };
                    if pxid == xid {
                        found = Some(LookupOutcome::ByMainXid);
                        break;
                    }
                    // A subtransaction is always newer than its parent.
                    if xid < pxid {
                        continue;
                    }
                    if entry.subxids.ids().iter().rev().any(|&c| c == xid) {
                        found = Some(LookupOutcome::ByChildXid);
                        break;
                    }
                    if entry.subxids.is_overflowed() {
                        overflowed.push(pxid);
                    }
                }
                found
            }
        };

        let answer = if let Some(outcome) = found {
            stats.record_lookup(outcome);
            true
        } else if overflowed.is_empty() {
            stats.record_lookup(LookupOutcome::NoOverflow);
            false
        } else {
            stats.record_lookup(LookupOutcome::SlowAnswer);
            if self.clog.did_abort(xid) {
                false
            } else {
                let top = self.subtrans.topmost(xid);
                top != xid && overflowed.contains(&top)
            }
        };
        backend.scratch = overflowed;
        tracing::trace!(%xid, answer, "in-progress lookup");
        answer
    }

    fn fast_path(&self, backend: &BackendState, xid: TransactionId) -> Option<(bool, LookupOutcome)> {
        if xid < backend.recent_xmin() {
            return Some((false, LookupOutcome::ByRecentXmin));
        }
        if self.clog.is_known_completed(xid) {
            return Some((false, LookupOutcome::ByKnownCompleted));
        }
        if backend.is_current_transaction(xid, self.subtrans.as_ref()) {
            return Some((true, LookupOutcome::ByMyXact));
        }
        None
    }

    /// Whether a connected backend is running `xid` as its top-level
    /// transaction. Prepared transactions and subtransactions do not count.
    #[must_use]
    pub fn is_active(&self, backend: &BackendState, xid: TransactionId) -> bool {
        if xid < backend.recent_xmin() || self.clog.is_known_completed(xid) {
            return false;
        }
        self.procs
            .read()
            .iter()
            .any(|(_, entry)| !entry.is_prepared() && entry.xid == Some(xid))
    }

    /// Oldest xid any matching transaction may still need to see.
    ///
    /// Starts from the watermark plus one and is lowered by the xid and xmin
    /// of every entry in the backend's database (or every database when
    /// `all_databases`). Entries running maintenance are skipped when
    /// `ignore_vacuum` is set.
    #[must_use]
    pub fn oldest_xmin(
        &self,
        backend: &BackendState,
        all_databases: bool,
        ignore_vacuum: bool,
    ) -> TransactionId {
        let table = self.procs.read();
        let latest = self.procs.latest_completed();
        let mut result = latest.checked_next().unwrap_or(latest);
        for (_, entry) in table.iter() {
            if ignore_vacuum && entry.in_vacuum {
                continue;
            }
            if !all_databases && entry.database != backend.database() {
                continue;
            }
            for candidate in [entry.xid, entry.xmin.get()].into_iter().flatten() {
                if candidate.is_normal() && candidate < result {
                    result = candidate;
                }
            }
        }
        result
    }

    /// Whether the creator `tref` was still running as of `snapshot`.
    #[must_use]
    pub fn xid_in_snapshot(&self, snapshot: &Snapshot, tref: TransactionRef) -> bool {
        distributed::xid_in_snapshot(snapshot, tref, self.subtrans.as_ref())
    }
}
