//! Per-backend transaction context.
//!
//! A [`BackendState`] is everything one backend keeps to itself: its
//! process array handle, its transaction and subtransaction ids, the
//! horizons computed by its last snapshot, its distributed role and the
//! scratch buffer the visibility oracle borrows. It may live on any thread
//! but is never shared.

use std::sync::Arc;

use mppsnap_error::{MppError, Result};
use mppsnap_types::{
    CancelToken, CommandId, DatabaseId, IsolationLevel, Pid, RoleId, SessionId, TransactionId,
};

use crate::distributed::DtxRole;
use crate::oracle::SubtransAncestry;
use crate::proc_array::{ProcArray, ProcEntry, ProcHandle, SubxidCache};
use crate::shared_snapshot::{SharedLocalSnapshotSlot, WriterTransaction};
use crate::xid_gen::XidAllocator;

/// Transaction context of one attached backend.
#[derive(Debug)]
pub struct BackendState {
    handle: ProcHandle,
    pid: Pid,
    database: DatabaseId,
    role_id: RoleId,
    session: Option<SessionId>,
    xid: Option<TransactionId>,
    /// Every subtransaction id assigned in the current transaction, cached or
    /// not.
    subxids: Vec<TransactionId>,
    isolation: IsolationLevel,
    curcid: CommandId,
    pub(crate) recent_xmin: TransactionId,
    pub(crate) recent_global_xmin: TransactionId,
    pub(crate) transaction_xmin: Option<TransactionId>,
    dtx: DtxRole,
    gang_slot: Option<Arc<SharedLocalSnapshotSlot>>,
    /// Writer transaction adopted by a reader; counts as this backend's own.
    pub(crate) writer: WriterTransaction,
    pub(crate) cancel: CancelToken,
    /// Sized to the process array so lookups never allocate under the lock.
    pub(crate) scratch: Vec<TransactionId>,
}

impl BackendState {
    /// Register `entry` in `array` and build the matching context.
    ///
    /// # Errors
    ///
    /// Propagates [`ProcArray::add`] failures. A prepared-transaction entry
    /// (no pid) is rejected as internal misuse.
    pub fn attach(array: &ProcArray, entry: ProcEntry) -> Result<Self> {
        let pid = entry
            .pid
            .ok_or_else(|| MppError::internal("backend entry without pid"))?;
        let database = entry.database;
        let role_id = entry.role;
        let session = entry.gang.map(|g| g.session);
        let handle = array.add(entry)?;
        tracing::debug!(%handle, %pid, %database, "backend attached");
        Ok(Self {
            handle,
            pid,
            database,
            role_id,
            session,
            xid: None,
            subxids: Vec::new(),
            isolation: IsolationLevel::default(),
            curcid: CommandId::FIRST,
            recent_xmin: TransactionId::FIRST_NORMAL,
            recent_global_xmin: TransactionId::FIRST_NORMAL,
            transaction_xmin: None,
            dtx: DtxRole::LocalOnly,
            gang_slot: None,
            writer: WriterTransaction::default(),
            cancel: CancelToken::new(),
            scratch: Vec::with_capacity(array.capacity()),
        })
    }

    /// Leave the process array. A transaction still holding an xid counts as
    /// completed for the watermark.
    pub fn detach(self, array: &ProcArray) {
        let latest = self.latest_xid();
        array.remove(self.handle, latest);
        tracing::debug!(handle = %self.handle, pid = %self.pid, "backend detached");
    }

    // -----------------------------------------------------------------------
    // Transaction boundaries
    // -----------------------------------------------------------------------

    /// Start a transaction at `isolation`.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] if this backend was detached behind
    /// its back.
    pub fn begin(&mut self, array: &ProcArray, isolation: IsolationLevel) -> Result<()> {
        self.isolation = isolation;
        self.curcid = CommandId::FIRST;
        array.set_serializable(self.handle, isolation.uses_transaction_snapshot())
    }

    /// Assign the top-level xid if the transaction has none yet.
    ///
    /// # Errors
    ///
    /// Propagates allocator exhaustion and stale-handle errors.
    pub fn assign_xid(&mut self, array: &ProcArray, alloc: &XidAllocator) -> Result<TransactionId> {
        if let Some(xid) = self.xid {
            return Ok(xid);
        }
        let xid = alloc.assign()?;
        array.set_xid(self.handle, xid)?;
        self.xid = Some(xid);
        tracing::trace!(handle = %self.handle, %xid, "xid assigned");
        Ok(xid)
    }

    /// Start a subtransaction, assigning the top-level xid first if needed.
    ///
    /// # Errors
    ///
    /// Propagates allocator exhaustion and stale-handle errors.
    pub fn assign_subxid(&mut self, array: &ProcArray, alloc: &XidAllocator) -> Result<TransactionId> {
        self.assign_xid(array, alloc)?;
        let sub = alloc.assign()?;
        array.add_subxid(self.handle, sub)?;
        self.subxids.push(sub);
        Ok(sub)
    }

    /// Roll back subtransaction `sub` and every subtransaction started after
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] if the entry is gone.
    pub fn abort_subtransaction(&mut self, array: &ProcArray, sub: TransactionId) -> Result<()> {
        let Some(pos) = self.subxids.iter().position(|&x| x == sub) else {
            tracing::warn!(handle = %self.handle, xid = %sub, "aborting unknown subtransaction");
            return Ok(());
        };
        let children = &self.subxids[pos + 1..];
        let latest = children.iter().copied().fold(sub, TransactionId::max);
        array.remove_running_subxids(self.handle, sub, children, latest)?;
        self.subxids.truncate(pos);
        Ok(())
    }

    /// Commit or abort the transaction: clear the entry and advance the
    /// watermark past every id it used.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] if the entry is gone.
    pub fn finish_transaction(&mut self, array: &ProcArray) -> Result<()> {
        let latest = self.latest_xid();
        array.end_transaction(self.handle, latest)?;
        self.reset_transaction();
        Ok(())
    }

    /// Hand the transaction over to a prepared-transaction entry and leave
    /// this backend free for the next one.
    ///
    /// # Errors
    ///
    /// Returns an internal error when there is no xid to prepare, and
    /// propagates process array failures.
    pub fn prepare(&mut self, array: &ProcArray) -> Result<ProcHandle> {
        let xid = self
            .xid
            .ok_or_else(|| MppError::internal("prepare without an assigned xid"))?;
        let cache = SubxidCache::from_ids(&self.subxids, array.max_cached_subxids());
        let entry = ProcEntry::prepared(self.database, self.role_id, xid, cache);
        let prepared = array.transfer_to_prepared(self.handle, entry)?;
        tracing::debug!(handle = %self.handle, %prepared, %xid, "transaction prepared");
        self.reset_transaction();
        Ok(prepared)
    }

    fn reset_transaction(&mut self) {
        self.xid = None;
        self.subxids.clear();
        self.isolation = IsolationLevel::default();
        self.curcid = CommandId::FIRST;
        self.transaction_xmin = None;
        self.writer.clear();
    }

    fn latest_xid(&self) -> Option<TransactionId> {
        let top = self.xid?;
        Some(self.subxids.iter().copied().fold(top, TransactionId::max))
    }

    /// Advance to the next command of the transaction.
    ///
    /// # Errors
    ///
    /// Returns an internal error when the command counter wraps.
    pub fn command_counter_increment(&mut self) -> Result<CommandId> {
        self.curcid = self
            .curcid
            .checked_next()
            .ok_or_else(|| MppError::internal("command id space exhausted"))?;
        Ok(self.curcid)
    }

    // -----------------------------------------------------------------------
    // Distributed role
    // -----------------------------------------------------------------------

    /// Set the role for the next statement.
    pub fn set_role(&mut self, role: DtxRole) {
        self.dtx = role;
    }

    /// Join a gang by attaching its shared snapshot slot.
    pub fn attach_gang_slot(&mut self, slot: Arc<SharedLocalSnapshotSlot>) {
        self.gang_slot = Some(slot);
    }

    /// Whether `xid` is this backend's own transaction or subtransaction,
    /// including the writer transaction and subtransactions a reader
    /// adopted. `subtrans` resolves writer subtransactions that did not fit
    /// in the published cache.
    #[must_use]
    pub fn is_current_transaction(
        &self,
        xid: TransactionId,
        subtrans: &dyn SubtransAncestry,
    ) -> bool {
        self.xid == Some(xid) || self.subxids.contains(&xid) || self.writer.contains(xid, subtrans)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[inline]
    #[must_use]
    pub const fn handle(&self) -> ProcHandle {
        self.handle
    }

    #[inline]
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    #[must_use]
    pub const fn database(&self) -> DatabaseId {
        self.database
    }

    #[inline]
    #[must_use]
    pub const fn session(&self) -> Option<SessionId> {
        self.session
    }

    #[inline]
    #[must_use]
    pub const fn xid(&self) -> Option<TransactionId> {
        self.xid
    }

    #[must_use]
    pub fn subxids(&self) -> &[TransactionId] {
        &self.subxids
    }

    #[inline]
    #[must_use]
    pub const fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    #[inline]
    #[must_use]
    pub const fn curcid(&self) -> CommandId {
        self.curcid
    }

    /// Oldest xid that was running when the last snapshot was built.
    #[inline]
    #[must_use]
    pub const fn recent_xmin(&self) -> TransactionId {
        self.recent_xmin
    }

    /// Oldest xmin any backend held when the last snapshot was built.
    #[inline]
    #[must_use]
    pub const fn recent_global_xmin(&self) -> TransactionId {
        self.recent_global_xmin
    }

    /// Xmin published by the first snapshot of the current transaction.
    #[inline]
    #[must_use]
    pub const fn transaction_xmin(&self) -> Option<TransactionId> {
        self.transaction_xmin
    }

    /// Writer xid adopted from the gang slot, for readers.
    #[inline]
    #[must_use]
    pub const fn writer_xid(&self) -> Option<TransactionId> {
        self.writer.xid
    }

    /// Writer transaction adopted from the gang slot, for readers.
    #[must_use]
    pub const fn writer_transaction(&self) -> &WriterTransaction {
        &self.writer
    }

    #[must_use]
    pub const fn dtx_role(&self) -> &DtxRole {
        &self.dtx
    }

    #[must_use]
    pub fn gang_slot(&self) -> Option<&Arc<SharedLocalSnapshotSlot>> {
        self.gang_slot.as_ref()
    }

    /// Token that cancels this backend's blocking waits.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Clear the per-transaction horizons once the transaction is over.
    pub(crate) fn clear_horizons(&mut self) {
        self.transaction_xmin = None;
        self.writer.clear();
        self.recent_xmin = TransactionId::FIRST_NORMAL;
        self.recent_global_xmin = TransactionId::FIRST_NORMAL;
    }
}
