//! Gang snapshot handshake.
//!
//! Backends of one worker gang on a node must read with the same local
//! snapshot. The gang writer builds it and publishes it into the gang's
//! [`SharedLocalSnapshotSlot`]; readers wait until the slot carries the
//! correlation of the statement they were dispatched, then copy it.
//!
//! The wait is a condvar wait bounded by a deadline. Every publish bumps a
//! sequence number under its own mutex, and a reader checks the slot while
//! holding that mutex, so a publish between the check and the wait can not
//! be missed. Publishers never hold the sequence mutex and the slot lock at
//! the same time.

use std::fmt::{self, Write as _};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mppsnap_error::{MppError, Result};
use mppsnap_types::{
    CancelToken, CommandId, DispatchCorrelation, Pid, SessionId, Snapshot, TransactionId,
};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::config::{MvccConfig, ReaderWaitConfig};
use crate::oracle::SubtransAncestry;

// ---------------------------------------------------------------------------
// Writer transaction
// ---------------------------------------------------------------------------

/// The gang writer's transaction as its readers see it: the top-level xid
/// and the subtransaction ids the writer had cached when it published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterTransaction {
    pub xid: Option<TransactionId>,
    pub subxids: Vec<TransactionId>,
    /// The writer had more subtransactions than fit in `subxids`.
    pub subxids_overflowed: bool,
}

impl WriterTransaction {
    /// Whether `xid` is the writer's transaction or one of its
    /// subtransactions. `subtrans` is consulted only when the cache
    /// overflowed.
    #[must_use]
    pub fn contains(&self, xid: TransactionId, subtrans: &dyn SubtransAncestry) -> bool {
        let Some(top) = self.xid else {
            return false;
        };
        if xid == top || self.subxids.contains(&xid) {
            return true;
        }
        // A subtransaction is always newer than its parent.
        self.subxids_overflowed && xid > top && subtrans.topmost(xid) == top
    }

    pub(crate) fn clear(&mut self) {
        self.xid = None;
        self.subxids.clear();
        self.subxids_overflowed = false;
    }

    fn copy_from(&mut self, other: &Self) {
        self.xid = other.xid;
        self.subxids.clone_from(&other.subxids);
        self.subxids_overflowed = other.subxids_overflowed;
    }
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SlotState {
    session: Option<SessionId>,
    writer_pid: Option<Pid>,
    writer: WriterTransaction,
    correlation: Option<DispatchCorrelation>,
    ready: bool,
    snapshot: Snapshot,
}

impl SlotState {
    fn matches(&self, expected: &DispatchCorrelation) -> bool {
        self.ready && self.correlation.as_ref() == Some(expected)
    }
}

/// One gang's published snapshot.
#[derive(Debug)]
pub struct SharedLocalSnapshotSlot {
    index: usize,
    max_cached_subxids: usize,
    state: RwLock<SlotState>,
    publish_seq: Mutex<u64>,
    published: Condvar,
}

impl SharedLocalSnapshotSlot {
    fn new(index: usize, running_capacity: usize, max_cached_subxids: usize) -> Self {
        Self {
            index,
            max_cached_subxids,
            state: RwLock::new(SlotState {
                session: None,
                writer_pid: None,
                writer: WriterTransaction {
                    xid: None,
                    subxids: Vec::with_capacity(max_cached_subxids),
                    subxids_overflowed: false,
                },
                correlation: None,
                ready: false,
                snapshot: Snapshot::with_capacity(
                    running_capacity,
                    running_capacity.saturating_mul(max_cached_subxids),
                ),
            }),
            publish_seq: Mutex::new(0),
            published: Condvar::new(),
        }
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn session(&self) -> Option<SessionId> {
        self.state.read().session
    }

    fn claim(&self, session: SessionId, writer: Pid) {
        let mut state = self.state.write();
        state.session = Some(session);
        state.writer_pid = Some(writer);
        state.writer.clear();
        state.correlation = None;
        state.ready = false;
    }

    /// Publish the writer's local snapshot for the statement identified by
    /// `correlation`, along with the writer's xid and as many of its
    /// subtransaction ids as the slot caches.
    ///
    /// Only the local part is shared; readers take the distributed part from
    /// their own dispatch.
    pub fn publish(
        &self,
        correlation: DispatchCorrelation,
        writer_xid: Option<TransactionId>,
        writer_subxids: &[TransactionId],
        snapshot: &Snapshot,
    ) {
        let cached = writer_subxids.len().min(self.max_cached_subxids);
        {
            let mut state = self.state.write();
            copy_local(&mut state.snapshot, snapshot);
            state.writer.xid = writer_xid;
            state.writer.subxids.clear();
            state.writer.subxids.extend_from_slice(&writer_subxids[..cached]);
            state.writer.subxids_overflowed = writer_subxids.len() > cached;
            state.correlation = Some(correlation);
            state.ready = true;
        }
        self.bump();
        tracing::trace!(
            slot = self.index,
            %correlation,
            ?writer_xid,
            writer_subxids = writer_subxids.len(),
            "published gang snapshot"
        );
    }

    /// Refresh the published command id of a serializable writer for the
    /// next statement of the same distributed transaction.
    ///
    /// Applies only while the slot still carries `correlation`'s distributed
    /// xid; returns whether it did.
    pub fn update_command_id(&self, correlation: DispatchCorrelation, curcid: CommandId) -> bool {
        let published = {
            let mut state = self.state.write();
            let current = state.correlation.map(|c| c.coordinator_xid);
            if current == Some(correlation.coordinator_xid) {
                state.snapshot.curcid = curcid;
                state.correlation = Some(correlation);
                Ok(())
            } else {
                Err(current)
            }
        };
        match published {
            Ok(()) => {
                self.bump();
                tracing::trace!(slot = self.index, %correlation, %curcid, "updated gang snapshot command id");
                true
            }
            Err(current) => {
                tracing::debug!(
                    slot = self.index,
                    %correlation,
                    current = ?current,
                    "gang snapshot belongs to another distributed transaction"
                );
                false
            }
        }
    }

    fn bump(&self) {
        let mut seq = self.publish_seq.lock();
        *seq = seq.wrapping_add(1);
        self.published.notify_all();
    }

    /// Whether the slot currently holds the snapshot for `expected`.
    #[must_use]
    pub fn is_ready_for(&self, expected: &DispatchCorrelation) -> bool {
        self.state.read().matches(expected)
    }

    /// Copy the local part into `out` and the writer's transaction into
    /// `writer` if the slot matches `expected`.
    fn try_adopt(
        &self,
        expected: &DispatchCorrelation,
        out: &mut Snapshot,
        writer: &mut WriterTransaction,
    ) -> bool {
        let state = self.state.read();
        if !state.matches(expected) {
            return false;
        }
        copy_local(out, &state.snapshot);
        writer.copy_from(&state.writer);
        true
    }

    /// Wait until the writer publishes the snapshot for `expected`, then copy
    /// its local part into `out` and the writer's transaction into `writer`.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::QueryCanceled`] when `cancel` fires and
    /// [`MppError::ReaderSnapshotTimeout`] when `config.timeout` passes first.
    pub fn wait_for_match(
        &self,
        expected: &DispatchCorrelation,
        out: &mut Snapshot,
        writer: &mut WriterTransaction,
        cancel: &CancelToken,
        config: &ReaderWaitConfig,
    ) -> Result<()> {
        let started = Instant::now();
        let deadline = started + config.timeout;
        let mut next_report = started + config.warn_every;
        let mut slice = config.initial_poll;
        {
            let mut seq = self.publish_seq.lock();
            loop {
                if self.try_adopt(expected, out, writer) {
                    tracing::trace!(
                        slot = self.index,
                        %expected,
                        waited_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
                        "reader adopted gang snapshot"
                    );
                    return Ok(());
                }
                if cancel.is_cancel_requested() {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                if now >= next_report {
                    tracing::info!(
                        slot = self.index,
                        %expected,
                        waited_ms = u64::try_from(now.duration_since(started).as_millis()).unwrap_or(u64::MAX),
                        "reader still waiting for writer snapshot"
                    );
                    next_report = now + config.warn_every;
                }
                let observed = *seq;
                let wait = slice.min(deadline.saturating_duration_since(now));
                let _ = self.published.wait_for(&mut seq, wait);
                if *seq == observed {
                    slice = (slice * 2).min(config.max_poll);
                }
            }
        }
        cancel.checkpoint()?;
        let published = self.describe();
        tracing::error!(slot = self.index, %expected, %published, "reader timed out waiting for writer snapshot");
        Err(MppError::ReaderSnapshotTimeout {
            waited: started.elapsed(),
            expected: expected.to_string(),
            published,
        })
    }

    /// Release the slot for the next gang.
    pub fn reset(&self) {
        {
            let mut state = self.state.write();
            state.session = None;
            state.writer_pid = None;
            state.writer.clear();
            state.correlation = None;
            state.ready = false;
            state.snapshot.running.clear();
            state.snapshot.subxids.clear();
        }
        self.bump();
    }

    /// One-line description for diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SharedLocalSnapshotSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        write!(f, "slot {}", self.index)?;
        match state.session {
            Some(session) => write!(f, " {session}")?,
            None => return f.write_str(" free"),
        }
        if let Some(pid) = state.writer_pid {
            write!(f, " writer {pid}")?;
        }
        if let Some(xid) = state.writer.xid {
            write!(f, " {xid}")?;
        }
        match state.correlation {
            Some(c) if state.ready => write!(f, " {c} {}", state.snapshot),
            Some(c) => write!(f, " {c} not ready"),
            None => f.write_str(" not ready"),
        }
    }
}

/// Copy everything but the distributed part.
fn copy_local(dst: &mut Snapshot, src: &Snapshot) {
    dst.xmin = src.xmin;
    dst.xmax = src.xmax;
    dst.running.clone_from(&src.running);
    dst.subxids.clone_from(&src.subxids);
    dst.subxids_overflowed = src.subxids_overflowed;
    dst.curcid = src.curcid;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Fixed table of gang slots keyed by session id.
#[derive(Debug)]
pub struct SharedSnapshotRegistry {
    slots: Vec<Arc<SharedLocalSnapshotSlot>>,
    owners: Mutex<Vec<Option<SessionId>>>,
    changed: Condvar,
    wait_timeout: Duration,
}

impl SharedSnapshotRegistry {
    /// Build the slot table sized from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: &MvccConfig) -> Result<Self> {
        config.validate()?;
        let count = config.shared_snapshot_slots();
        let running_capacity = config.proc_array_capacity();
        let max_cached_subxids = config.max_cached_subxids;
        tracing::info!(slots = count, "shared snapshot registry initialised");
        Ok(Self {
            slots: (0..count)
                .map(|i| Arc::new(SharedLocalSnapshotSlot::new(i, running_capacity, max_cached_subxids)))
                .collect(),
            owners: Mutex::new(vec![None; count]),
            changed: Condvar::new(),
            wait_timeout: config.shared_snapshot.wait_timeout,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn in_use(&self) -> usize {
        self.owners.lock().iter().filter(|o| o.is_some()).count()
    }

    /// Claim a slot for the gang of `session`, written by `writer`.
    ///
    /// A slot still held by an earlier writer of the same session is waited
    /// on, since that writer may still be exiting.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`MppError::SharedSnapshotCollision`] when the
    /// session's old slot is not released in time and the fatal
    /// [`MppError::SharedSnapshotSlotsExhausted`] when every slot is taken.
    pub fn add(&self, session: SessionId, writer: Pid) -> Result<Arc<SharedLocalSnapshotSlot>> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut owners = self.owners.lock();
        let mut logged = false;
        while owners.contains(&Some(session)) {
            if !logged {
                tracing::info!(%session, %writer, "waiting for previous gang writer to release its snapshot slot");
                logged = true;
            }
            if self.changed.wait_until(&mut owners, deadline).timed_out()
                && owners.contains(&Some(session))
            {
                drop(owners);
                tracing::error!(%session, %writer, "gang shared snapshot collision");
                return Err(MppError::SharedSnapshotCollision {
                    session: session.get(),
                });
            }
        }
        let Some(index) = owners.iter().position(Option::is_none) else {
            drop(owners);
            tracing::error!(capacity = self.slots.len(), "out of shared snapshot slots");
            return Err(MppError::SharedSnapshotSlotsExhausted {
                capacity: self.slots.len(),
            });
        };
        owners[index] = Some(session);
        let slot = Arc::clone(&self.slots[index]);
        slot.claim(session, writer);
        drop(owners);
        tracing::debug!(%session, %writer, slot = index, "claimed shared snapshot slot");
        Ok(slot)
    }

    /// Find the slot of `session`, waiting for its writer to create it.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::SharedSnapshotNotFound`] when no slot appears
    /// within the configured wait.
    pub fn lookup(&self, session: SessionId) -> Result<Arc<SharedLocalSnapshotSlot>> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut owners = self.owners.lock();
        loop {
            if let Some(index) = owners.iter().position(|o| *o == Some(session)) {
                return Ok(Arc::clone(&self.slots[index]));
            }
            if self.changed.wait_until(&mut owners, deadline).timed_out()
                && !owners.contains(&Some(session))
            {
                drop(owners);
                tracing::warn!(%session, "no shared snapshot slot for session");
                return Err(MppError::SharedSnapshotNotFound {
                    session: session.get(),
                });
            }
        }
    }

    /// Release the slot of `session`. Returns whether one was held.
    pub fn remove(&self, session: SessionId) -> bool {
        let released = {
            let mut owners = self.owners.lock();
            let index = owners.iter().position(|o| *o == Some(session));
            if let Some(index) = index {
                owners[index] = None;
                self.slots[index].reset();
            }
            index
        };
        self.changed.notify_all();
        match released {
            Some(slot) => {
                tracing::debug!(%session, slot, "released shared snapshot slot");
                true
            }
            None => {
                tracing::warn!(%session, "no shared snapshot slot to release");
                false
            }
        }
    }

    /// Describe every slot in use, one per line.
    #[must_use]
    pub fn dump(&self) -> String {
        let in_use: Vec<usize> = self
            .owners
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.map(|_| i))
            .collect();
        let mut out = format!("{} of {} shared snapshot slots in use\n", in_use.len(), self.slots.len());
        for i in in_use {
            let _ = writeln!(out, "{}", self.slots[i]);
        }
        out
    }
}
