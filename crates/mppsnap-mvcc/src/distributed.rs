//! Distributed half of a snapshot.
//!
//! The coordinator asks the global transaction directory for the in-progress
//! distributed ids while it already holds the process array lock, so the
//! local and distributed views describe the same instant. Workers never
//! compute one; they copy what was dispatched with the statement, and map
//! local xids of row creators to distributed ones through their
//! [`DistributedLog`].

use std::fmt;
use std::sync::Arc;

use mppsnap_types::{
    DispatchedStatement, DistributedSnapshot, DistributedVisibility, DistributedXid, Snapshot,
    TransactionId, TransactionRef,
};

use crate::config::MvccConfig;
use crate::oracle::{DistributedLog, GlobalTransactionDirectory, SubtransAncestry};

// ---------------------------------------------------------------------------
// DtxRole
// ---------------------------------------------------------------------------

/// Part a backend plays in the current distributed statement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DtxRole {
    /// Purely local work; snapshots carry no distributed part.
    #[default]
    LocalOnly,
    /// Coordinator backend running distributed transaction `gxid`.
    Coordinator(DistributedXid),
    /// Gang member that computes the local snapshot and publishes it.
    Writer(DispatchedStatement),
    /// Gang member that adopts the writer's published snapshot.
    Reader(DispatchedStatement),
}

impl DtxRole {
    /// Statement dispatched to this worker, if any.
    #[must_use]
    pub const fn dispatched(&self) -> Option<&DispatchedStatement> {
        match self {
            Self::Writer(stmt) | Self::Reader(stmt) => Some(stmt),
            Self::LocalOnly | Self::Coordinator(_) => None,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::LocalOnly => "local",
            Self::Coordinator(_) => "coordinator",
            Self::Writer(_) => "writer",
            Self::Reader(_) => "reader",
        }
    }
}

impl fmt::Display for DtxRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinator(gxid) => write!(f, "coordinator({gxid})"),
            Self::Writer(stmt) | Self::Reader(stmt) => {
                write!(f, "{}({})", self.name(), stmt.correlation)
            }
            Self::LocalOnly => f.write_str(self.name()),
        }
    }
}

// ---------------------------------------------------------------------------
// DistributedSnapshotCoordinator
// ---------------------------------------------------------------------------

/// Produces the distributed part of snapshots on one node.
#[derive(Clone)]
pub struct DistributedSnapshotCoordinator {
    directory: Option<Arc<dyn GlobalTransactionDirectory>>,
    log: Option<Arc<dyn DistributedLog>>,
    max_in_progress: usize,
}

impl fmt::Debug for DistributedSnapshotCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedSnapshotCoordinator")
            .field("has_directory", &self.directory.is_some())
            .field("has_log", &self.log.is_some())
            .field("max_in_progress", &self.max_in_progress)
            .finish()
    }
}

impl DistributedSnapshotCoordinator {
    /// Coordinator node backed by `directory`, which also resolves local
    /// xids. The distributed buffer holds `config.max_distributed_xacts`.
    #[must_use]
    pub fn coordinator(
        directory: Arc<dyn GlobalTransactionDirectory>,
        config: &MvccConfig,
    ) -> Self {
        Self {
            directory: Some(directory),
            log: None,
            max_in_progress: config.max_distributed_xacts,
        }
    }

    /// Worker node: only ever copies dispatched snapshots. Attach a log with
    /// [`Self::with_distributed_log`] to resolve row creators.
    #[must_use]
    pub fn worker(config: &MvccConfig) -> Self {
        Self {
            directory: None,
            log: None,
            max_in_progress: config.max_distributed_xacts,
        }
    }

    /// Resolve local xids through `log` instead of the directory.
    #[must_use]
    pub fn with_distributed_log(mut self, log: Arc<dyn DistributedLog>) -> Self {
        self.log = Some(log);
        self
    }

    #[must_use]
    pub const fn is_coordinator(&self) -> bool {
        self.directory.is_some()
    }

    /// Whether a backend in `role` builds its distributed part under the
    /// process array lock.
    #[must_use]
    pub const fn builds_in_lock(&self, role: &DtxRole) -> bool {
        self.is_coordinator() && matches!(role, DtxRole::Coordinator(_))
    }

    /// Make sure `snapshot` owns a distributed buffer large enough for a
    /// capture. Call before taking the lock.
    pub fn prepare_buffer(&self, snapshot: &mut Snapshot) {
        let ds = snapshot
            .distributed
            .get_or_insert_with(DistributedSnapshot::default);
        let room = self.max_in_progress.saturating_sub(ds.in_progress.len());
        ds.in_progress.reserve(room);
    }

    /// Build the distributed part in place. Caller holds the process array
    /// lock and has called [`Self::prepare_buffer`].
    pub(crate) fn capture_in_lock(&self, role: &DtxRole, snapshot: &mut Snapshot) {
        let (Some(directory), DtxRole::Coordinator(gxid)) = (&self.directory, role) else {
            return;
        };
        if let Some(ds) = snapshot.distributed.as_mut() {
            directory.capture(Some(*gxid), ds);
        }
    }

    /// Classify the creator of a row version stamped with local `xid`.
    #[must_use]
    pub fn resolve(&self, xid: TransactionId) -> TransactionRef {
        let gxid = match (&self.log, &self.directory) {
            (Some(log), _) => log.distributed_xid_of(xid),
            (None, Some(directory)) => directory.distributed_xid_of(xid),
            (None, None) => None,
        };
        match gxid {
            Some(gxid) => TransactionRef::Distributed { gxid, local: xid },
            None => TransactionRef::Local(xid),
        }
    }

    /// Copy the dispatched distributed snapshot into `snapshot`.
    pub fn fill_from_dispatch(&self, dispatched: &DistributedSnapshot, snapshot: &mut Snapshot) {
        match snapshot.distributed.as_mut() {
            Some(ds) => ds.copy_from(dispatched),
            None => snapshot.distributed = Some(dispatched.clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Visibility split
// ---------------------------------------------------------------------------

/// Whether the creator `tref` was still running as of `snapshot`.
///
/// A distributed creator is judged only by the distributed part when the
/// snapshot has one; a local creator, or any creator when the snapshot is
/// purely local, only by the local running and subtransaction sets.
pub fn xid_in_snapshot(
    snapshot: &Snapshot,
    tref: TransactionRef,
    ancestry: &dyn SubtransAncestry,
) -> bool {
    match tref {
        TransactionRef::Distributed { gxid, local } => match &snapshot.distributed {
            Some(ds) => ds.check(gxid) == DistributedVisibility::InProgress,
            None => local_in_snapshot(snapshot, local, ancestry),
        },
        TransactionRef::Local(xid) => local_in_snapshot(snapshot, xid, ancestry),
    }
}

fn local_in_snapshot(
    snapshot: &Snapshot,
    xid: TransactionId,
    ancestry: &dyn SubtransAncestry,
) -> bool {
    snapshot.local_in_progress(xid, |sub| ancestry.topmost(sub))
}
