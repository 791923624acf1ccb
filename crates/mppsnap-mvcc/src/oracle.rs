//! Collaborator contracts consumed by this crate, plus in-memory stores.
//!
//! The commit log, the subtransaction ancestry store, the distributed log
//! and the global transaction directory are owned by other subsystems. The in-memory
//! implementations here back tests and single-node embedding.

use std::collections::{BTreeMap, HashMap};

use mppsnap_error::{MppError, Result};
use mppsnap_types::{DistributedSnapshot, DistributedSnapshotId, DistributedXid, TransactionId};
use parking_lot::{Mutex, RwLock};

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Durable outcome of a local transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XidStatus {
    InProgress,
    Committed,
    Aborted,
    /// Subtransaction committed into a parent that is still running.
    SubCommitted,
}

/// Commit-status store keyed by local xid.
pub trait CommitLog: Send + Sync {
    fn status(&self, xid: TransactionId) -> XidStatus;

    /// Whether `xid` is already known to have finished, one way or the other.
    fn is_known_completed(&self, xid: TransactionId) -> bool {
        matches!(self.status(xid), XidStatus::Committed | XidStatus::Aborted)
    }

    fn did_abort(&self, xid: TransactionId) -> bool {
        self.status(xid) == XidStatus::Aborted
    }
}

/// Parent links of subtransactions.
pub trait SubtransAncestry: Send + Sync {
    /// Topmost ancestor of `xid`; `xid` itself for a top-level transaction.
    fn topmost(&self, xid: TransactionId) -> TransactionId;
}

/// Node-local map from local xids to the distributed transactions they ran
/// for. Present on every node.
pub trait DistributedLog: Send + Sync {
    /// Distributed id of the transaction that ran as local `xid` on this
    /// node, if it was part of one.
    fn distributed_xid_of(&self, xid: TransactionId) -> Option<DistributedXid>;
}

/// Coordinator-side registry of distributed transactions.
pub trait GlobalTransactionDirectory: DistributedLog {
    /// Fill `out` with the current in-progress set and low-water mark.
    ///
    /// Called inside the process array's critical section; implementations
    /// must not block on anything that can wait for that lock, and must only
    /// push into `out.in_progress` up to its reserved capacity.
    fn capture(&self, requester: Option<DistributedXid>, out: &mut DistributedSnapshot);

    /// Assign a distributed id to a new distributed transaction.
    ///
    /// # Errors
    ///
    /// Returns an error when the id space is exhausted.
    fn begin(&self) -> Result<DistributedXid>;

    /// Forget a committed or aborted distributed transaction.
    fn forget(&self, gxid: DistributedXid);
}

// ---------------------------------------------------------------------------
// In-memory commit log
// ---------------------------------------------------------------------------

/// Commit log held in a hash map. Unknown ids read as in progress.
#[derive(Debug, Default)]
pub struct InMemoryCommitLog {
    statuses: RwLock<HashMap<TransactionId, XidStatus>>,
}

impl InMemoryCommitLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, xid: TransactionId, status: XidStatus) {
        self.statuses.write().insert(xid, status);
    }
}

impl CommitLog for InMemoryCommitLog {
    fn status(&self, xid: TransactionId) -> XidStatus {
        if !xid.is_normal() {
            return XidStatus::Committed;
        }
        self.statuses
            .read()
            .get(&xid)
            .copied()
            .unwrap_or(XidStatus::InProgress)
    }
}

// ---------------------------------------------------------------------------
// In-memory ancestry
// ---------------------------------------------------------------------------

/// Parent map for subtransactions.
#[derive(Debug, Default)]
pub struct InMemorySubtrans {
    parents: RwLock<HashMap<TransactionId, TransactionId>>,
}

impl InMemorySubtrans {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parent(&self, child: TransactionId, parent: TransactionId) {
        self.parents.write().insert(child, parent);
    }
}

impl SubtransAncestry for InMemorySubtrans {
    fn topmost(&self, xid: TransactionId) -> TransactionId {
        let parents = self.parents.read();
        let mut current = xid;
        // Parents always precede children, so the walk terminates.
        while let Some(&parent) = parents.get(&current) {
            if parent >= current {
                break;
            }
            current = parent;
        }
        current
    }
}

// ---------------------------------------------------------------------------
// In-memory distributed transaction directory
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct DirectoryState {
    next_gxid: DistributedXid,
    next_snapshot_id: u64,
    /// Running distributed transactions and the xmin of the first
    /// distributed snapshot each one took.
    running: BTreeMap<DistributedXid, Option<DistributedXid>>,
    /// Local xids bound to their distributed transaction. Kept after
    /// `forget` so row versions stay resolvable.
    local: HashMap<TransactionId, DistributedXid>,
}

/// Single-coordinator directory kept in memory.
#[derive(Debug)]
pub struct InMemoryDtxDirectory {
    epoch: u32,
    state: Mutex<DirectoryState>,
}

impl InMemoryDtxDirectory {
    /// Directory for a coordinator started at `epoch`.
    #[must_use]
    pub fn new(epoch: u32) -> Self {
        Self {
            epoch,
            state: Mutex::new(DirectoryState {
                next_gxid: DistributedXid::FIRST,
                next_snapshot_id: 1,
                running: BTreeMap::new(),
                local: HashMap::new(),
            }),
        }
    }

    /// Record that distributed transaction `gxid` runs as local `xid`.
    pub fn bind_local(&self, gxid: DistributedXid, xid: TransactionId) {
        self.state.lock().local.insert(xid, gxid);
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }
}

impl GlobalTransactionDirectory for InMemoryDtxDirectory {
    fn capture(&self, requester: Option<DistributedXid>, out: &mut DistributedSnapshot) {
        let mut state = self.state.lock();
        out.id = DistributedSnapshotId::new(state.next_snapshot_id);
        state.next_snapshot_id += 1;
        out.coordinator_epoch = self.epoch;
        out.xmax = state.next_gxid;
        out.in_progress.clear();
        let mut xmin = out.xmax;
        let mut xmin_all = out.xmax;
        for (&gxid, &snapshot_xmin) in &state.running {
            if let Some(s) = snapshot_xmin {
                xmin_all = xmin_all.min(s);
            }
            if Some(gxid) == requester || gxid >= out.xmax {
                continue;
            }
            if out.in_progress.len() == out.in_progress.capacity() {
                // Out of room: this id and every later one count as running.
                tracing::warn!(%gxid, "distributed snapshot buffer full; lowering xmax");
                out.xmax = gxid;
                continue;
            }
            out.in_progress.push(gxid);
            xmin = xmin.min(gxid);
        }
        let xmin = xmin.min(out.xmax);
        out.xmin = xmin;
        out.xmin_all_snapshots = xmin_all.min(xmin);
        if let Some(gxid) = requester {
            if let Some(first_xmin) = state.running.get_mut(&gxid) {
                first_xmin.get_or_insert(xmin);
            }
        }
    }

    fn begin(&self) -> Result<DistributedXid> {
        let mut state = self.state.lock();
        let gxid = state.next_gxid;
        let next = gxid.checked_next().ok_or_else(|| {
            MppError::internal("distributed transaction id space exhausted")
        })?;
        state.next_gxid = next;
        state.running.insert(gxid, None);
        drop(state);
        tracing::debug!(%gxid, "distributed transaction begun");
        Ok(gxid)
    }

    fn forget(&self, gxid: DistributedXid) {
        let removed = self.state.lock().running.remove(&gxid).is_some();
        if !removed {
            tracing::warn!(%gxid, "forgetting unknown distributed transaction");
        }
    }
}

impl DistributedLog for InMemoryDtxDirectory {
    fn distributed_xid_of(&self, xid: TransactionId) -> Option<DistributedXid> {
        self.state.lock().local.get(&xid).copied()
    }
}

// ---------------------------------------------------------------------------
// In-memory distributed log
// ---------------------------------------------------------------------------

/// Local-to-distributed xid map for worker nodes.
#[derive(Debug, Default)]
pub struct InMemoryDistributedLog {
    entries: RwLock<HashMap<TransactionId, DistributedXid>>,
}

impl InMemoryDistributedLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that local `xid` ran for distributed transaction `gxid`.
    pub fn record(&self, xid: TransactionId, gxid: DistributedXid) {
        self.entries.write().insert(xid, gxid);
    }
}

impl DistributedLog for InMemoryDistributedLog {
    fn distributed_xid_of(&self, xid: TransactionId) -> Option<DistributedXid> {
        self.entries.read().get(&xid).copied()
    }
}
