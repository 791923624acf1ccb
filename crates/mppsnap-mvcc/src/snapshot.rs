//! Snapshot construction.
//!
//! [`SnapshotBuilder::build`] scans the process array once under its shared
//! lock and fills a caller-owned [`Snapshot`]. Buffers are sized to the array
//! capacity before the lock is taken, so the critical section never
//! allocates. On a coordinator the distributed part is captured in the same
//! critical section; gang readers skip the scan entirely and adopt the
//! writer's published snapshot.

use std::sync::Arc;

use mppsnap_error::{MppError, Result};
use mppsnap_types::Snapshot;

use crate::backend::BackendState;
use crate::config::{MvccConfig, ReaderWaitConfig};
use crate::distributed::{DistributedSnapshotCoordinator, DtxRole};
use crate::proc_array::ProcArray;

/// Builds snapshots against one node's process array.
#[derive(Debug)]
pub struct SnapshotBuilder {
    procs: Arc<ProcArray>,
    dtx: DistributedSnapshotCoordinator,
    reader_wait: ReaderWaitConfig,
}

impl SnapshotBuilder {
    #[must_use]
    pub fn new(procs: Arc<ProcArray>, dtx: DistributedSnapshotCoordinator, config: &MvccConfig) -> Self {
        Self {
            procs,
            dtx,
            reader_wait: config.reader_wait,
        }
    }

    #[must_use]
    pub fn procs(&self) -> &Arc<ProcArray> {
        &self.procs
    }

    #[must_use]
    pub const fn coordinator(&self) -> &DistributedSnapshotCoordinator {
        &self.dtx
    }

    /// Fill `snapshot` with the current view for `backend`.
    ///
    /// Besides the snapshot itself this publishes the backend's xmin the
    /// first time in a transaction and refreshes its `RecentXmin`,
    /// `RecentGlobalXmin` and `TransactionXmin` horizons. A gang writer also
    /// publishes the result to its slot; a gang reader waits for it.
    ///
    /// # Errors
    ///
    /// Readers fail with [`MppError::ReaderSnapshotTimeout`] or
    /// [`MppError::QueryCanceled`]; gang members without a slot fail with
    /// [`MppError::WrongRole`]; a watermark at the top of the id space is an
    /// internal error.
    pub fn build(&self, backend: &mut BackendState, snapshot: &mut Snapshot) -> Result<()> {
        if matches!(backend.dtx_role(), DtxRole::Reader(_)) {
            return self.adopt_from_writer(backend, snapshot);
        }
        self.scan(backend, snapshot)?;
        if let DtxRole::Writer(stmt) = backend.dtx_role() {
            let slot = backend
                .gang_slot()
                .ok_or_else(|| MppError::wrong_role("writer", "no gang snapshot slot attached"))?;
            slot.publish(stmt.correlation, backend.xid(), backend.subxids(), snapshot);
        }
        Ok(())
    }

    fn scan(&self, backend: &mut BackendState, snapshot: &mut Snapshot) -> Result<()> {
        let capacity = self.procs.capacity();
        snapshot.reserve_for(
            capacity,
            capacity.saturating_mul(self.procs.max_cached_subxids()),
        );
        let capture = self.dtx.builds_in_lock(backend.dtx_role());
        if capture {
            self.dtx.prepare_buffer(snapshot);
        }

        let own = backend.handle();
        let mut first_xmin = None;
        let (xmin, xmax, mut global_xmin) = {
            let table = self.procs.read();
            let latest = self.procs.latest_completed();
            let Some(xmax) = latest.checked_next() else {
                drop(table);
                return Err(MppError::internal("latest completed xid at top of id space"));
            };
            if capture {
                self.dtx.capture_in_lock(backend.dtx_role(), snapshot);
            }

            snapshot.running.clear();
            snapshot.subxids.clear();
            snapshot.subxids_overflowed = false;
            let mut xmin = xmax;
            let mut global_xmin = xmax;
            for (handle, entry) in table.iter() {
                if let Some(entry_xmin) = entry.xmin.get().filter(|x| x.is_normal()) {
                    global_xmin = global_xmin.min(entry_xmin);
                }
                let Some(xid) = entry.xid.filter(|x| x.is_normal()) else {
                    continue;
                };
                // Ids at or past xmax count as running without being listed.
                if xid >= xmax {
                    continue;
                }
                xmin = xmin.min(xid);
                if handle == own {
                    continue;
                }
                snapshot.running.push(xid);
                if !snapshot.subxids_overflowed {
                    if entry.subxids.is_overflowed() {
                        snapshot.subxids_overflowed = true;
                        snapshot.subxids.clear();
                    } else {
                        snapshot.subxids.extend_from_slice(entry.subxids.ids());
                    }
                }
            }
            if let Some(mine) = table.get(own) {
                if mine.xmin.get().is_none() {
                    mine.xmin.set(Some(xmin));
                    first_xmin = Some(xmin);
                }
            }
            (xmin, xmax, global_xmin)
        };
        self.procs.stats_ref().record_snapshot(snapshot.subxids_overflowed);

        match backend.dtx_role().dispatched() {
            Some(stmt) if !capture => self.dtx.fill_from_dispatch(&stmt.distributed, snapshot),
            _ if !capture => snapshot.distributed = None,
            _ => {}
        }

        global_xmin = global_xmin.min(xmin);
        snapshot.xmin = xmin;
        snapshot.xmax = xmax;
        snapshot.curcid = backend.curcid();
        if first_xmin.is_some() {
            backend.transaction_xmin = first_xmin;
        }
        backend.recent_xmin = xmin;
        backend.recent_global_xmin = global_xmin;
        tracing::trace!(
            handle = %own,
            xmin = %xmin,
            xmax = %xmax,
            global_xmin = %global_xmin,
            running = snapshot.running.len(),
            subxids = snapshot.subxids.len(),
            overflowed = snapshot.subxids_overflowed,
            "built snapshot"
        );
        Ok(())
    }

    fn adopt_from_writer(&self, backend: &mut BackendState, snapshot: &mut Snapshot) -> Result<()> {
        let DtxRole::Reader(stmt) = backend.dtx_role() else {
            return Err(MppError::internal("reader path taken without reader role"));
        };
        let expected = stmt.correlation;
        self.dtx.fill_from_dispatch(&stmt.distributed, snapshot);
        let slot = backend
            .gang_slot()
            .cloned()
            .ok_or_else(|| MppError::wrong_role("reader", "no gang snapshot slot attached"))?;
        slot.wait_for_match(
            &expected,
            snapshot,
            &mut backend.writer,
            &backend.cancel,
            &self.reader_wait,
        )?;
        tracing::debug!(
            handle = %backend.handle(),
            %expected,
            writer_xid = ?backend.writer.xid,
            writer_subxids = backend.writer.subxids.len(),
            fingerprint = snapshot.fingerprint(),
            "reader adopted writer snapshot"
        );
        Ok(())
    }
}
