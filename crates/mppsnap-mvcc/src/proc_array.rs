//! The process array: one entry per attached backend or prepared transaction.
//!
//! Entries live in a fixed slot table sized at construction. A dense list of
//! live slot indexes makes scans proportional to the number of attached
//! entries, and removal swaps the last live index into the hole. Callers hold
//! a generation-tagged [`ProcHandle`]; a handle that outlives its entry never
//! aliases the slot's next occupant.
//!
//! All mutation takes the exclusive lock; scans take the shared lock. The one
//! exception is an entry's `xmin`, which its owner publishes while holding
//! the shared lock during a snapshot build (see [`XminCell`]).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mppsnap_error::{MppError, Result};
use mppsnap_types::{DatabaseId, Pid, RoleId, SessionId, TransactionId};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;

use crate::config::MvccConfig;
use crate::observability::{ProcArrayStats, ProcArrayStatsSnapshot};

// ---------------------------------------------------------------------------
// ProcHandle
// ---------------------------------------------------------------------------

/// Generation-tagged reference to a process array slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcHandle {
    index: u32,
    generation: u32,
}

impl ProcHandle {
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ProcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc[{}@{}]", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// Entry fields
// ---------------------------------------------------------------------------

/// An entry's published xmin.
///
/// The owning backend stores its xmin while holding only the shared lock, so
/// a concurrent `oldest_xmin` scan sees either the old or the new value and
/// never a torn one. Zero encodes "unset".
#[derive(Default)]
pub struct XminCell(AtomicU64);

impl XminCell {
    #[must_use]
    pub fn new(xmin: Option<TransactionId>) -> Self {
        Self(AtomicU64::new(xmin.map_or(0, TransactionId::get)))
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> Option<TransactionId> {
        TransactionId::new(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set(&self, xmin: Option<TransactionId>) {
        self.0
            .store(xmin.map_or(0, TransactionId::get), Ordering::Release);
    }
}

impl Clone for XminCell {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl PartialEq for XminCell {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Eq for XminCell {}

impl fmt::Debug for XminCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(xid) => write!(f, "{xid}"),
            None => f.write_str("unset"),
        }
    }
}

/// Bounded cache of a transaction's subtransaction ids.
///
/// Once more ids were assigned than fit, `overflowed` stays set until the
/// transaction ends and readers must fall back to the ancestry store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubxidCache {
    ids: SmallVec<[TransactionId; 8]>,
    overflowed: bool,
}

impl SubxidCache {
    /// Build a cache from `ids`, keeping at most `limit` of them.
    #[must_use]
    pub fn from_ids(ids: &[TransactionId], limit: usize) -> Self {
        let mut cache = Self::default();
        for &xid in ids {
            cache.push(xid, limit);
        }
        cache
    }

    /// Cache `xid`; returns `false` when the cache is (now) overflowed.
    pub fn push(&mut self, xid: TransactionId, limit: usize) -> bool {
        if self.overflowed {
            return false;
        }
        if self.ids.len() >= limit {
            self.overflowed = true;
            return false;
        }
        self.ids.push(xid);
        true
    }

    #[inline]
    #[must_use]
    pub fn ids(&self) -> &[TransactionId] {
        &self.ids
    }

    #[inline]
    #[must_use]
    pub const fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, xid: TransactionId) -> bool {
        self.ids.contains(&xid)
    }

    /// Drop `xid` from the cache. Order is not preserved.
    pub fn remove(&mut self, xid: TransactionId) -> bool {
        match self.ids.iter().position(|&x| x == xid) {
            Some(pos) => {
                self.ids.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.overflowed = false;
    }
}

/// Membership of a backend in a worker gang.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GangMembership {
    pub session: SessionId,
    pub is_writer: bool,
}

/// One process array entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    /// `None` for a prepared transaction, which has no backend.
    pub pid: Option<Pid>,
    pub database: DatabaseId,
    pub role: RoleId,
    pub xid: Option<TransactionId>,
    pub xmin: XminCell,
    pub subxids: SubxidCache,
    /// Running a lazy vacuum or similar maintenance task.
    pub in_vacuum: bool,
    /// Transaction runs at a snapshot-per-transaction isolation level.
    pub serializable: bool,
    /// Transaction has dropped a relation and holds it until commit.
    pub drop_transaction: bool,
    pub gang: Option<GangMembership>,
}

impl ProcEntry {
    /// Entry for a connected backend with no transaction yet.
    #[must_use]
    pub fn backend(pid: Pid, database: DatabaseId, role: RoleId) -> Self {
        Self {
            pid: Some(pid),
            database,
            role,
            xid: None,
            xmin: XminCell::default(),
            subxids: SubxidCache::default(),
            in_vacuum: false,
            serializable: false,
            drop_transaction: false,
            gang: None,
        }
    }

    /// Entry standing in for a prepared transaction after its backend left.
    #[must_use]
    pub fn prepared(
        database: DatabaseId,
        role: RoleId,
        xid: TransactionId,
        subxids: SubxidCache,
    ) -> Self {
        Self {
            pid: None,
            xid: Some(xid),
            subxids,
            ..Self::backend(Pid::new(0), database, role)
        }
    }

    /// Attach gang membership.
    #[must_use]
    pub const fn with_gang(mut self, session: SessionId, is_writer: bool) -> Self {
        self.gang = Some(GangMembership { session, is_writer });
        self
    }

    #[inline]
    #[must_use]
    pub const fn is_prepared(&self) -> bool {
        self.pid.is_none()
    }

    fn clear_transaction_fields(&mut self) {
        self.xid = None;
        self.xmin.set(None);
        self.subxids.clear();
        self.in_vacuum = false;
        self.serializable = false;
        self.drop_transaction = false;
    }
}

// ---------------------------------------------------------------------------
// Slot table
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Slot {
    generation: u32,
    dense_pos: u32,
    entry: Option<ProcEntry>,
}

/// Lock-protected part of the array.
#[derive(Debug)]
pub(crate) struct ProcTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: Vec<u32>,
}

impl ProcTable {
    fn with_capacity(capacity: u32) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    generation: 0,
                    dense_pos: 0,
                    entry: None,
                })
                .collect(),
            free: (0..capacity).rev().collect(),
            live: Vec::with_capacity(capacity as usize),
        }
    }

    pub(crate) fn get(&self, handle: ProcHandle) -> Option<&ProcEntry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn get_mut(&mut self, handle: ProcHandle) -> Option<&mut ProcEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Live entries in dense order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (ProcHandle, &ProcEntry)> + '_ {
        self.live.iter().filter_map(move |&index| {
            let slot = &self.slots[index as usize];
            slot.entry.as_ref().map(|entry| {
                (
                    ProcHandle {
                        index,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.live.len()
    }

    fn insert(&mut self, entry: ProcEntry) -> Option<ProcHandle> {
        let index = self.free.pop()?;
        #[allow(clippy::cast_possible_truncation)] // live.len() < capacity, which fits u32
        let dense_pos = self.live.len() as u32;
        self.live.push(index);
        let slot = &mut self.slots[index as usize];
        slot.dense_pos = dense_pos;
        slot.entry = Some(entry);
        Some(ProcHandle {
            index,
            generation: slot.generation,
        })
    }

    fn take(&mut self, handle: ProcHandle) -> Option<ProcEntry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        let pos = slot.dense_pos as usize;
        self.live.swap_remove(pos);
        if let Some(&moved) = self.live.get(pos) {
            #[allow(clippy::cast_possible_truncation)]
            let pos = pos as u32;
            self.slots[moved as usize].dense_pos = pos;
        }
        self.free.push(handle.index);
        Some(entry)
    }
}

// ---------------------------------------------------------------------------
// ProcArray
// ---------------------------------------------------------------------------

/// Backends and prepared transactions still attached to one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DbUsage {
    pub backends: usize,
    pub prepared: usize,
}

impl DbUsage {
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.backends == 0 && self.prepared == 0
    }
}

/// Shared registry of running transactions on one node.
pub struct ProcArray {
    capacity: usize,
    max_cached_subxids: usize,
    table: RwLock<ProcTable>,
    /// Latest completed xid. Advanced only under the exclusive lock, read
    /// lock-free by anyone.
    latest_completed: AtomicU64,
    exit_epoch: Mutex<u64>,
    exit_cv: Condvar,
    db_backend_exit_wait: Duration,
    stats: ProcArrayStats,
}

impl fmt::Debug for ProcArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcArray")
            .field("capacity", &self.capacity)
            .field("live", &self.live_count())
            .field("latest_completed", &self.latest_completed())
            .finish_non_exhaustive()
    }
}

impl ProcArray {
    /// Build an empty array sized from `config`, with no completed
    /// transactions yet.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: &MvccConfig) -> Result<Self> {
        Self::with_latest_completed(config, TransactionId::FROZEN)
    }

    /// Build an empty array whose watermark starts at `latest_completed`,
    /// as after recovery.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::InvalidConfig`] if `config` fails validation.
    pub fn with_latest_completed(
        config: &MvccConfig,
        latest_completed: TransactionId,
    ) -> Result<Self> {
        config.validate()?;
        let capacity = config.proc_array_capacity();
        let table_capacity = u32::try_from(capacity)
            .map_err(|_| MppError::invalid_config("process array capacity exceeds u32"))?;
        tracing::info!(
            capacity,
            max_cached_subxids = config.max_cached_subxids,
            latest_completed = %latest_completed,
            "process array initialised"
        );
        Ok(Self {
            capacity,
            max_cached_subxids: config.max_cached_subxids,
            table: RwLock::new(ProcTable::with_capacity(table_capacity)),
            latest_completed: AtomicU64::new(latest_completed.get()),
            exit_epoch: Mutex::new(0),
            exit_cv: Condvar::new(),
            db_backend_exit_wait: config.db_backend_exit_wait,
            stats: ProcArrayStats::default(),
        })
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub const fn max_cached_subxids(&self) -> usize {
        self.max_cached_subxids
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.read().len()
    }

    /// Latest completed xid. Never decreases.
    #[inline]
    #[must_use]
    pub fn latest_completed(&self) -> TransactionId {
        TransactionId::new(self.latest_completed.load(Ordering::Acquire))
            .unwrap_or(TransactionId::FROZEN)
    }

    #[must_use]
    pub fn stats(&self) -> ProcArrayStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_ref(&self) -> &ProcArrayStats {
        &self.stats
    }

    /// Shared lock, counted.
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, ProcTable> {
        self.stats.record_shared_lock();
        self.table.read()
    }

    fn write(&self) -> RwLockWriteGuard<'_, ProcTable> {
        self.stats.record_exclusive_lock();
        self.table.write()
    }

    /// Raise the watermark to `xid` if it is newer. Caller holds the
    /// exclusive lock.
    fn advance_latest_completed(&self, _guard: &RwLockWriteGuard<'_, ProcTable>, xid: TransactionId) {
        self.latest_completed.fetch_max(xid.get(), Ordering::AcqRel);
    }

    // -----------------------------------------------------------------------
    // Lifecycle hooks
    // -----------------------------------------------------------------------

    /// Attach an entry.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`MppError::TooManyClients`] when every slot is in
    /// use and [`MppError::DuplicateBackend`] when `entry.pid` is already
    /// attached.
    pub fn add(&self, entry: ProcEntry) -> Result<ProcHandle> {
        let pid = entry.pid;
        let outcome = {
            let mut table = self.write();
            let duplicate = pid.is_some() && table.iter().any(|(_, e)| e.pid == pid);
            if duplicate {
                Err(())
            } else {
                Ok(table.insert(entry))
            }
        };
        match outcome {
            Err(()) => {
                let pid = pid.map_or(0, Pid::get);
                tracing::error!(pid, "backend already attached to process array");
                Err(MppError::DuplicateBackend { pid })
            }
            Ok(None) => {
                tracing::error!(capacity = self.capacity, "process array full");
                Err(MppError::TooManyClients {
                    capacity: self.capacity,
                })
            }
            Ok(Some(handle)) => {
                tracing::debug!(%handle, ?pid, "attached to process array");
                Ok(handle)
            }
        }
    }

    /// Detach an entry, first advancing the watermark to `latest_xid`.
    ///
    /// Returns the removed entry, or `None` (logged) when `handle` is stale.
    pub fn remove(&self, handle: ProcHandle, latest_xid: Option<TransactionId>) -> Option<ProcEntry> {
        let removed = {
            let mut table = self.write();
            if let Some(xid) = latest_xid {
                self.advance_latest_completed(&table, xid);
            }
            table.take(handle)
        };
        match &removed {
            Some(entry) => {
                tracing::debug!(%handle, pid = ?entry.pid, ?latest_xid, "detached from process array");
                let mut epoch = self.exit_epoch.lock();
                *epoch = epoch.wrapping_add(1);
                self.exit_cv.notify_all();
            }
            None => {
                tracing::warn!(%handle, "failed to find entry to remove from process array");
            }
        }
        removed
    }

    /// Mark the entry's transaction finished.
    ///
    /// With `latest_xid` (the transaction had an xid) the watermark advances
    /// in the same critical section that clears the xid, so no snapshot can
    /// see the transaction both gone from the array and not yet completed.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] when `handle` no longer names an
    /// entry.
    pub fn end_transaction(&self, handle: ProcHandle, latest_xid: Option<TransactionId>) -> Result<()> {
        let found = {
            let mut table = self.write();
            if let Some(xid) = latest_xid {
                self.advance_latest_completed(&table, xid);
            }
            table.get_mut(handle).map(ProcEntry::clear_transaction_fields).is_some()
        };
        if !found {
            return Err(stale(handle));
        }
        tracing::trace!(%handle, ?latest_xid, "transaction ended");
        Ok(())
    }

    /// Clear the entry's transaction fields without touching the watermark.
    ///
    /// Used after PREPARE, when a prepared-transaction entry has taken over
    /// the xid and the backend moves on.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] when `handle` no longer names an
    /// entry.
    pub fn clear_transaction(&self, handle: ProcHandle) -> Result<()> {
        self.update(handle, ProcEntry::clear_transaction_fields)
    }

    /// Move the transaction of `handle` to the prepared-transaction entry
    /// `prepared`.
    ///
    /// The new entry is inserted and the backend's transaction fields are
    /// cleared in one critical section, so every snapshot lists the xid
    /// exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] when `handle` no longer names an
    /// entry and the fatal [`MppError::TooManyClients`] when there is no free
    /// slot. Nothing changes in either case.
    pub fn transfer_to_prepared(
        &self,
        handle: ProcHandle,
        prepared: ProcEntry,
    ) -> Result<ProcHandle> {
        let outcome = {
            let mut table = self.write();
            if table.get(handle).is_none() {
                None
            } else {
                let inserted = table.insert(prepared);
                if inserted.is_some() {
                    if let Some(entry) = table.get_mut(handle) {
                        entry.clear_transaction_fields();
                    }
                }
                Some(inserted)
            }
        };
        match outcome {
            None => Err(stale(handle)),
            Some(None) => {
                tracing::error!(capacity = self.capacity, "process array full");
                Err(MppError::TooManyClients {
                    capacity: self.capacity,
                })
            }
            Some(Some(new)) => {
                tracing::debug!(%handle, prepared = %new, "transaction moved to prepared entry");
                Ok(new)
            }
        }
    }

    /// Publish the entry's top-level xid.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] when `handle` no longer names an
    /// entry.
    pub fn set_xid(&self, handle: ProcHandle, xid: TransactionId) -> Result<()> {
        self.update(handle, |entry| entry.xid = Some(xid))
    }

    /// Cache a newly assigned subtransaction id.
    ///
    /// Returns `false` when the cache overflowed instead.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] when `handle` no longer names an
    /// entry.
    pub fn add_subxid(&self, handle: ProcHandle, xid: TransactionId) -> Result<bool> {
        let limit = self.max_cached_subxids;
        let mut cached = false;
        self.update(handle, |entry| cached = entry.subxids.push(xid, limit))?;
        if !cached {
            tracing::debug!(%handle, %xid, "subtransaction cache overflowed");
        }
        Ok(cached)
    }

    /// Forget aborted subtransactions `xid` and `children` and advance the
    /// watermark to `latest_xid`.
    ///
    /// Ids missing from the cache are expected when it overflowed and are
    /// otherwise logged.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] when `handle` no longer names an
    /// entry.
    pub fn remove_running_subxids(
        &self,
        handle: ProcHandle,
        xid: TransactionId,
        children: &[TransactionId],
        latest_xid: TransactionId,
    ) -> Result<()> {
        let mut missing: SmallVec<[TransactionId; 4]> = SmallVec::new();
        let overflowed = {
            let mut table = self.write();
            let Some(entry) = table.get_mut(handle) else {
                drop(table);
                return Err(stale(handle));
            };
            for &child in children.iter().chain(std::iter::once(&xid)) {
                if !entry.subxids.remove(child) && missing.len() < missing.inline_size() {
                    missing.push(child);
                }
            }
            let overflowed = entry.subxids.is_overflowed();
            self.advance_latest_completed(&table, latest_xid);
            overflowed
        };
        if !overflowed {
            for xid in missing {
                tracing::warn!(%handle, %xid, "did not find subtransaction id in cache to remove");
            }
        }
        Ok(())
    }

    /// Mark the entry as running at a snapshot-per-transaction level.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] when `handle` no longer names an
    /// entry.
    pub fn set_serializable(&self, handle: ProcHandle, serializable: bool) -> Result<()> {
        self.update(handle, |entry| entry.serializable = serializable)
    }

    /// Set or clear the maintenance flag.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] when `handle` no longer names an
    /// entry.
    pub fn set_in_vacuum(&self, handle: ProcHandle, in_vacuum: bool) -> Result<()> {
        self.update(handle, |entry| entry.in_vacuum = in_vacuum)
    }

    /// Set or clear the drop-transaction flag.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::StaleHandle`] when `handle` no longer names an
    /// entry.
    pub fn set_drop_transaction(&self, handle: ProcHandle, dropping: bool) -> Result<()> {
        self.update(handle, |entry| entry.drop_transaction = dropping)
    }

    fn update(&self, handle: ProcHandle, f: impl FnOnce(&mut ProcEntry)) -> Result<()> {
        let found = {
            let mut table = self.write();
            table.get_mut(handle).map(f).is_some()
        };
        if found { Ok(()) } else { Err(stale(handle)) }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Copy of the entry behind `handle`.
    #[must_use]
    pub fn get(&self, handle: ProcHandle) -> Option<ProcEntry> {
        self.read().get(handle).cloned()
    }

    /// Entry of the backend with `pid`.
    #[must_use]
    pub fn proc_by_pid(&self, pid: Pid) -> Option<(ProcHandle, ProcEntry)> {
        self.read()
            .iter()
            .find(|(_, e)| e.pid == Some(pid))
            .map(|(h, e)| (h, e.clone()))
    }

    #[must_use]
    pub fn is_backend_pid(&self, pid: Pid) -> bool {
        self.read().iter().any(|(_, e)| e.pid == Some(pid))
    }

    /// Pid of the backend running top-level transaction `xid`. Prepared
    /// transactions have no pid.
    #[must_use]
    pub fn pid_of_xid(&self, xid: TransactionId) -> Option<Pid> {
        self.read()
            .iter()
            .find(|(_, e)| e.xid == Some(xid))
            .and_then(|(_, e)| e.pid)
    }

    /// Backends (not prepared transactions) that hold an xid.
    #[must_use]
    pub fn count_active_backends(&self) -> usize {
        self.read()
            .iter()
            .filter(|(_, e)| !e.is_prepared() && e.xid.is_some())
            .count()
    }

    /// Backends connected to `database`, or to any database when `None`.
    #[must_use]
    pub fn count_db_backends(&self, database: Option<DatabaseId>) -> usize {
        self.read()
            .iter()
            .filter(|(_, e)| !e.is_prepared() && database.is_none_or(|db| e.database == db))
            .count()
    }

    /// Backends connected as `role`.
    #[must_use]
    pub fn count_user_backends(&self, role: RoleId) -> usize {
        self.read()
            .iter()
            .filter(|(_, e)| !e.is_prepared() && e.role == role)
            .count()
    }

    /// Pid of the gang writer for `session`.
    #[must_use]
    pub fn find_writer_by_session(&self, session: SessionId) -> Option<Pid> {
        self.read()
            .iter()
            .find(|(_, e)| {
                e.gang
                    .is_some_and(|g| g.is_writer && g.session == session)
            })
            .and_then(|(_, e)| e.pid)
    }

    /// Whether any entry other than `exclude` runs a serializable
    /// transaction.
    #[must_use]
    pub fn has_serializable_backends(&self, exclude: Option<ProcHandle>) -> bool {
        self.read()
            .iter()
            .any(|(h, e)| Some(h) != exclude && e.serializable)
    }

    /// Whether a transaction in `database` holds a dropped relation.
    #[must_use]
    pub fn has_drop_transaction(&self, database: DatabaseId) -> bool {
        self.read()
            .iter()
            .any(|(_, e)| e.database == database && e.drop_transaction)
    }

    /// Count entries other than `exclude` attached to `database`.
    #[must_use]
    pub fn db_usage(&self, database: DatabaseId, exclude: Option<Pid>) -> DbUsage {
        let table = self.read();
        let mut usage = DbUsage::default();
        for (_, e) in table.iter() {
            if e.database != database || (e.pid.is_some() && e.pid == exclude) {
                continue;
            }
            if e.is_prepared() {
                usage.prepared += 1;
            } else {
                usage.backends += 1;
            }
        }
        usage
    }

    /// Wait up to `timeout` (the configured `db_backend_exit_wait` when
    /// `None`) for every other entry on `database` to go away.
    ///
    /// Returns the usage observed last; [`DbUsage::is_idle`] tells whether
    /// the database was vacated in time. Prepared transactions never exit on
    /// their own, so they end the wait early.
    pub fn wait_for_db_backends_exit(
        &self,
        database: DatabaseId,
        exclude: Option<Pid>,
        timeout: Option<Duration>,
    ) -> DbUsage {
        let deadline = Instant::now() + timeout.unwrap_or(self.db_backend_exit_wait);
        let mut epoch = self.exit_epoch.lock();
        loop {
            let usage = self.db_usage(database, exclude);
            if usage.is_idle() || usage.prepared > 0 {
                return usage;
            }
            if self.exit_cv.wait_until(&mut epoch, deadline).timed_out() {
                let usage = self.db_usage(database, exclude);
                tracing::info!(
                    %database,
                    backends = usage.backends,
                    prepared = usage.prepared,
                    "other backends still attached to database"
                );
                return usage;
            }
        }
    }
}

fn stale(handle: ProcHandle) -> MppError {
    MppError::StaleHandle {
        index: handle.index,
        generation: handle.generation,
    }
}
