//! Per-backend snapshot policy.
//!
//! Repeatable-read and serializable transactions read with the snapshot
//! taken by their first statement; read-committed transactions take a fresh
//! one per statement. Both buffers are reused across calls.

use std::sync::Arc;

use mppsnap_error::{MppError, Result};
use mppsnap_types::Snapshot;

use crate::backend::BackendState;
use crate::distributed::DtxRole;
use crate::snapshot::SnapshotBuilder;

/// Snapshot state of one backend.
#[derive(Debug)]
pub struct SnapshotManager {
    builder: Arc<SnapshotBuilder>,
    transaction: Snapshot,
    has_transaction: bool,
    latest: Snapshot,
}

impl SnapshotManager {
    #[must_use]
    pub fn new(builder: Arc<SnapshotBuilder>) -> Self {
        Self {
            builder,
            transaction: Snapshot::default(),
            has_transaction: false,
            latest: Snapshot::default(),
        }
    }

    /// Snapshot for the next statement of the current transaction.
    ///
    /// The first call of a transaction always builds. After that a
    /// transaction-snapshot isolation level gets the same snapshot back with
    /// the current command id (a gang writer also refreshes the command id
    /// its readers will adopt); read committed builds a new one.
    ///
    /// # Errors
    ///
    /// Propagates [`SnapshotBuilder::build`] failures.
    pub fn transaction_snapshot(&mut self, backend: &mut BackendState) -> Result<&Snapshot> {
        if !self.has_transaction {
            self.builder.build(backend, &mut self.transaction)?;
            self.has_transaction = true;
            tracing::debug!(
                handle = %backend.handle(),
                isolation = ?backend.isolation(),
                snapshot = %self.transaction,
                "transaction snapshot taken"
            );
            return Ok(&self.transaction);
        }
        if backend.isolation().uses_transaction_snapshot() {
            self.transaction.curcid = backend.curcid();
            if let (DtxRole::Writer(stmt), Some(slot)) = (backend.dtx_role(), backend.gang_slot()) {
                slot.update_command_id(stmt.correlation, backend.curcid());
            }
            return Ok(&self.transaction);
        }
        self.builder.build(backend, &mut self.latest)?;
        Ok(&self.latest)
    }

    /// A snapshot current as of now, even at a transaction-snapshot level.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::NoSnapshotSet`] before the transaction's first
    /// snapshot, and propagates [`SnapshotBuilder::build`] failures.
    pub fn latest_snapshot(&mut self, backend: &mut BackendState) -> Result<&Snapshot> {
        if !self.has_transaction {
            return Err(MppError::NoSnapshotSet);
        }
        self.builder.build(backend, &mut self.latest)?;
        Ok(&self.latest)
    }

    /// Whether the current transaction has taken its first snapshot.
    #[must_use]
    pub const fn has_transaction_snapshot(&self) -> bool {
        self.has_transaction
    }

    /// Forget the transaction's snapshots and horizons. Call after the
    /// transaction has ended.
    pub fn at_transaction_end(&mut self, backend: &mut BackendState) {
        self.has_transaction = false;
        backend.clear_horizons();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MvccConfig;
    use crate::distributed::DistributedSnapshotCoordinator;
    use crate::proc_array::{ProcArray, ProcEntry};
    use crate::xid_gen::XidAllocator;
    use mppsnap_types::{DatabaseId, IsolationLevel, Pid, RoleId, TransactionId};

    fn xid(raw: u64) -> TransactionId {
        TransactionId::new(raw).unwrap()
    }

    struct Node {
        procs: Arc<ProcArray>,
        alloc: XidAllocator,
        builder: Arc<SnapshotBuilder>,
    }

    fn node() -> Node {
        let config = MvccConfig {
            max_backends: 4,
            max_prepared_xacts: 0,
            ..MvccConfig::default()
        };
        let procs = Arc::new(ProcArray::new(&config).unwrap());
        let builder = Arc::new(SnapshotBuilder::new(
            Arc::clone(&procs),
            DistributedSnapshotCoordinator::worker(&config),
            &config,
        ));
        Node {
            procs,
            alloc: XidAllocator::default(),
            builder,
        }
    }

    fn attach(node: &Node, pid: u32) -> BackendState {
        BackendState::attach(
            &node.procs,
            ProcEntry::backend(Pid::new(pid), DatabaseId::new(1), RoleId::new(1)),
        )
        .unwrap()
    }

    #[test]
    fn serializable_reuses_first_snapshot() {
        let node = node();
        let mut me = attach(&node, 1);
        let mut other = attach(&node, 2);
        me.begin(&node.procs, IsolationLevel::Serializable).unwrap();
        let mut mgr = SnapshotManager::new(Arc::clone(&node.builder));
        let first = mgr.transaction_snapshot(&mut me).unwrap().clone();

        other.assign_xid(&node.procs, &node.alloc).unwrap();
        other.finish_transaction(&node.procs).unwrap();
        me.command_counter_increment().unwrap();

        let second = mgr.transaction_snapshot(&mut me).unwrap().clone();
        assert_eq!(second.xmax, first.xmax);
        assert_eq!(second.running, first.running);
        assert_eq!(second.curcid, me.curcid());

        let latest = mgr.latest_snapshot(&mut me).unwrap();
        assert!(latest.xmax > first.xmax);
    }

    #[test]
    fn read_committed_sees_new_commits() {
        let node = node();
        let mut me = attach(&node, 1);
        let mut other = attach(&node, 2);
        me.begin(&node.procs, IsolationLevel::ReadCommitted).unwrap();
        let mut mgr = SnapshotManager::new(Arc::clone(&node.builder));
        let running = other.assign_xid(&node.procs, &node.alloc).unwrap();
        // Make `running` fall below xmax.
        let mut third = attach(&node, 3);
        third.assign_xid(&node.procs, &node.alloc).unwrap();
        third.finish_transaction(&node.procs).unwrap();

        let first = mgr.transaction_snapshot(&mut me).unwrap().clone();
        assert_eq!(first.running, vec![running]);
        assert!(first.is_well_formed());

        other.finish_transaction(&node.procs).unwrap();
        let second = mgr.transaction_snapshot(&mut me).unwrap();
        assert!(second.running.is_empty());
        assert!(second.is_well_formed());
    }

    #[test]
    fn latest_snapshot_requires_transaction_snapshot() {
        let node = node();
        let mut me = attach(&node, 1);
        let mut mgr = SnapshotManager::new(Arc::clone(&node.builder));
        assert!(matches!(
            mgr.latest_snapshot(&mut me),
            Err(MppError::NoSnapshotSet)
        ));
        mgr.transaction_snapshot(&mut me).unwrap();
        assert!(mgr.latest_snapshot(&mut me).is_ok());
    }

    #[test]
    fn transaction_end_resets_state() {
        let node = node();
        let mut me = attach(&node, 1);
        let mut mgr = SnapshotManager::new(Arc::clone(&node.builder));
        me.begin(&node.procs, IsolationLevel::Serializable).unwrap();
        mgr.transaction_snapshot(&mut me).unwrap();
        assert!(mgr.has_transaction_snapshot());
        assert!(me.transaction_xmin().is_some());

        me.finish_transaction(&node.procs).unwrap();
        mgr.at_transaction_end(&mut me);
        assert!(!mgr.has_transaction_snapshot());
        assert_eq!(me.transaction_xmin(), None);
        assert_eq!(me.recent_xmin(), TransactionId::FIRST_NORMAL);
        assert!(matches!(
            mgr.latest_snapshot(&mut me),
            Err(MppError::NoSnapshotSet)
        ));
    }

    #[test]
    fn copies_are_independent() {
        let node = node();
        let mut me = attach(&node, 1);
        let mut mgr = SnapshotManager::new(Arc::clone(&node.builder));
        let copy = mgr.transaction_snapshot(&mut me).unwrap().clone();
        let again = copy.clone();
        drop(again);
        assert_eq!(&copy, mgr.transaction_snapshot(&mut me).unwrap());
        assert_eq!(copy.xmax, xid(3));
    }
}
