//! Snapshot value types.
//!
//! A [`Snapshot`] is the local read view; a [`DistributedSnapshot`] is the
//! cluster-wide view built by the coordinator and shipped verbatim to every
//! worker. Both are plain owned values: cloning is the copy operation and
//! dropping is the free operation.

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::{CommandId, DistributedSnapshotId, DistributedXid, TransactionId};

// ---------------------------------------------------------------------------
// TransactionRef
// ---------------------------------------------------------------------------

/// The creator of a row version, as seen by a visibility check.
///
/// Local transactions are judged against the local running set only.
/// Distributed transactions are judged against the distributed in-progress
/// set; `local` is the xid the transaction used on this node and is consulted
/// only when the snapshot carries no distributed part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionRef {
    Local(TransactionId),
    Distributed {
        gxid: DistributedXid,
        local: TransactionId,
    },
}

impl TransactionRef {
    /// The xid stamped on the row version on this node.
    #[inline]
    #[must_use]
    pub const fn local_xid(self) -> TransactionId {
        match self {
            Self::Local(xid) | Self::Distributed { local: xid, .. } => xid,
        }
    }
}

// ---------------------------------------------------------------------------
// DistributedSnapshot
// ---------------------------------------------------------------------------

/// Outcome of testing a distributed id against a [`DistributedSnapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistributedVisibility {
    /// The transaction was still running when the snapshot was taken.
    InProgress,
    /// The transaction had completed before the snapshot was taken.
    Visible,
}

/// Cluster-wide analogue of a [`Snapshot`], in distributed ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedSnapshot {
    pub id: DistributedSnapshotId,
    /// Start time of the coordinator that assigned these ids. Ids from a
    /// different coordinator incarnation are not comparable.
    pub coordinator_epoch: u32,
    /// Smallest distributed id still in progress.
    pub xmin: DistributedXid,
    /// First distributed id not yet assigned.
    pub xmax: DistributedXid,
    /// Smallest xmin across every distributed snapshot alive in the cluster.
    pub xmin_all_snapshots: DistributedXid,
    pub in_progress: Vec<DistributedXid>,
}

impl Default for DistributedSnapshot {
    fn default() -> Self {
        Self {
            id: DistributedSnapshotId::default(),
            coordinator_epoch: 0,
            xmin: DistributedXid::FIRST,
            xmax: DistributedXid::FIRST,
            xmin_all_snapshots: DistributedXid::FIRST,
            in_progress: Vec::new(),
        }
    }
}

impl DistributedSnapshot {
    /// Test `gxid` against the distributed in-progress set.
    #[must_use]
    pub fn check(&self, gxid: DistributedXid) -> DistributedVisibility {
        if gxid >= self.xmax {
            return DistributedVisibility::InProgress;
        }
        if gxid < self.xmin {
            return DistributedVisibility::Visible;
        }
        if self.in_progress.contains(&gxid) {
            DistributedVisibility::InProgress
        } else {
            DistributedVisibility::Visible
        }
    }

    /// Overwrite `self` with `other`, reusing the in-progress buffer.
    pub fn copy_from(&mut self, other: &Self) {
        self.id = other.id;
        self.coordinator_epoch = other.coordinator_epoch;
        self.xmin = other.xmin;
        self.xmax = other.xmax;
        self.xmin_all_snapshots = other.xmin_all_snapshots;
        self.in_progress.clone_from(&other.in_progress);
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Local MVCC read view.
///
/// Invariants: `xmin <= xmax`; every id in `running` lies in
/// `[xmin, xmax)` and appears once. `subxids` holds the cached
/// subtransaction ids of running transactions unless `subxids_overflowed` is
/// set, in which case some were not cached and callers must resolve
/// subtransactions to their top-level parent before testing `running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub xmin: TransactionId,
    pub xmax: TransactionId,
    pub running: Vec<TransactionId>,
    pub subxids: Vec<TransactionId>,
    pub subxids_overflowed: bool,
    pub curcid: CommandId,
    pub distributed: Option<DistributedSnapshot>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            xmin: TransactionId::FIRST_NORMAL,
            xmax: TransactionId::FIRST_NORMAL,
            running: Vec::new(),
            subxids: Vec::new(),
            subxids_overflowed: false,
            curcid: CommandId::FIRST,
            distributed: None,
        }
    }
}

impl Snapshot {
    /// An empty snapshot whose buffers can hold `running` top-level ids and
    /// `subxids` subtransaction ids without reallocating.
    #[must_use]
    pub fn with_capacity(running: usize, subxids: usize) -> Self {
        Self {
            running: Vec::with_capacity(running),
            subxids: Vec::with_capacity(subxids),
            ..Self::default()
        }
    }

    /// Make sure the buffers can take the given counts without growing.
    pub fn reserve_for(&mut self, running: usize, subxids: usize) {
        self.running
            .reserve(running.saturating_sub(self.running.len()));
        self.subxids
            .reserve(subxids.saturating_sub(self.subxids.len()));
    }

    /// Overwrite `self` with `other`, reusing every buffer already owned.
    pub fn copy_from(&mut self, other: &Self) {
        self.xmin = other.xmin;
        self.xmax = other.xmax;
        self.running.clone_from(&other.running);
        self.subxids.clone_from(&other.subxids);
        self.subxids_overflowed = other.subxids_overflowed;
        self.curcid = other.curcid;
        match (&mut self.distributed, &other.distributed) {
            (Some(mine), Some(theirs)) => mine.copy_from(theirs),
            (slot, theirs) => slot.clone_from(theirs),
        }
    }

    /// Check the range and uniqueness invariants.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        if self.xmin > self.xmax {
            return false;
        }
        if self
            .running
            .iter()
            .any(|&xid| xid < self.xmin || xid >= self.xmax)
        {
            return false;
        }
        let mut sorted = self.running.clone();
        sorted.sort_unstable();
        sorted.windows(2).all(|w| w[0] != w[1])
    }

    /// Whether a local `xid` was still running when this snapshot was taken.
    ///
    /// `topmost` maps a subtransaction id to its top-level parent; it is
    /// called only when the subxid cache overflowed.
    pub fn local_in_progress(
        &self,
        xid: TransactionId,
        topmost: impl FnOnce(TransactionId) -> TransactionId,
    ) -> bool {
        if xid < self.xmin {
            return false;
        }
        if xid >= self.xmax {
            return true;
        }
        let candidate = if self.subxids_overflowed {
            let top = topmost(xid);
            if top < self.xmin {
                return false;
            }
            top
        } else {
            if self.subxids.contains(&xid) {
                return true;
            }
            xid
        };
        self.running.contains(&candidate)
    }

    /// Stable hash of the local view, for diagnostics that compare snapshots
    /// across backends without dumping the arrays.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut h = Xxh3::new();
        h.update(&self.xmin.get().to_le_bytes());
        h.update(&self.xmax.get().to_le_bytes());
        h.update(&self.curcid.get().to_le_bytes());
        h.update(&[u8::from(self.subxids_overflowed)]);
        for xid in &self.running {
            h.update(&xid.get().to_le_bytes());
        }
        h.update(&[0xff]);
        for xid in &self.subxids {
            h.update(&xid.get().to_le_bytes());
        }
        h.digest()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "snapshot(xmin={} xmax={} running={} subxids={}{} {}",
            self.xmin.get(),
            self.xmax.get(),
            self.running.len(),
            self.subxids.len(),
            if self.subxids_overflowed { "+" } else { "" },
            self.curcid,
        )?;
        if let Some(ds) = &self.distributed {
            write!(f, " {} in_progress={}", ds.id, ds.in_progress.len())?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn xid(raw: u64) -> TransactionId {
        TransactionId::new(raw).unwrap()
    }

    fn gxid(raw: u64) -> DistributedXid {
        DistributedXid::new(raw).unwrap()
    }

    fn sample() -> Snapshot {
        Snapshot {
            xmin: xid(100),
            xmax: xid(110),
            running: vec![xid(100), xid(105)],
            subxids: vec![xid(106)],
            subxids_overflowed: false,
            curcid: CommandId::new(3),
            distributed: None,
        }
    }

    #[test]
    fn local_range_checks() {
        let snap = sample();
        let no_ancestry = |_: TransactionId| -> TransactionId { panic!("not overflowed") };
        assert!(!snap.local_in_progress(xid(99), no_ancestry));
        assert!(snap.local_in_progress(xid(110), no_ancestry));
        assert!(snap.local_in_progress(xid(200), no_ancestry));
        assert!(snap.local_in_progress(xid(105), no_ancestry));
        assert!(snap.local_in_progress(xid(106), no_ancestry));
        assert!(!snap.local_in_progress(xid(103), no_ancestry));
    }

    #[test]
    fn overflowed_snapshot_resolves_parent() {
        let mut snap = sample();
        snap.subxids.clear();
        snap.subxids_overflowed = true;
        // 107 is a child of 105 that did not fit in the cache.
        assert!(snap.local_in_progress(xid(107), |_| xid(105)));
        // A child whose parent predates xmin is not running.
        assert!(!snap.local_in_progress(xid(108), |_| xid(50)));
        assert!(!snap.local_in_progress(xid(109), |x| x));
    }

    #[test]
    fn distributed_check() {
        let ds = DistributedSnapshot {
            id: DistributedSnapshotId::new(4),
            coordinator_epoch: 1,
            xmin: gxid(10),
            xmax: gxid(20),
            xmin_all_snapshots: gxid(8),
            in_progress: vec![gxid(10), gxid(15)],
        };
        assert_eq!(ds.check(gxid(9)), DistributedVisibility::Visible);
        assert_eq!(ds.check(gxid(10)), DistributedVisibility::InProgress);
        assert_eq!(ds.check(gxid(12)), DistributedVisibility::Visible);
        assert_eq!(ds.check(gxid(15)), DistributedVisibility::InProgress);
        assert_eq!(ds.check(gxid(20)), DistributedVisibility::InProgress);
    }

    #[test]
    fn copy_round_trip_and_independence() {
        let mut original = sample();
        original.distributed = Some(DistributedSnapshot {
            in_progress: vec![gxid(3)],
            ..DistributedSnapshot::default()
        });
        let copy = original.clone();
        assert_eq!(copy, original);
        drop(copy);
        assert_eq!(original.running, vec![xid(100), xid(105)]);

        let mut reused = Snapshot::with_capacity(8, 8);
        let ptr = reused.running.as_ptr();
        reused.copy_from(&original);
        assert_eq!(reused, original);
        assert_eq!(reused.running.as_ptr(), ptr, "buffer must be reused");
    }

    #[test]
    fn copy_from_clears_distributed_part() {
        let mut target = sample();
        target.distributed = Some(DistributedSnapshot::default());
        target.copy_from(&sample());
        assert!(target.distributed.is_none());
    }

    #[test]
    fn well_formed_detects_violations() {
        assert!(sample().is_well_formed());
        let mut dup = sample();
        dup.running.push(xid(100));
        assert!(!dup.is_well_formed());
        let mut out_of_range = sample();
        out_of_range.running.push(xid(110));
        assert!(!out_of_range.is_well_formed());
        let mut inverted = sample();
        inverted.xmin = xid(120);
        assert!(!inverted.is_well_formed());
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.running.push(xid(107));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn display_is_compact() {
        let text = sample().to_string();
        assert_eq!(text, "snapshot(xmin=100 xmax=110 running=2 subxids=1 cid 3)");
    }

    #[test]
    fn transaction_ref_local_xid() {
        let r = TransactionRef::Distributed {
            gxid: gxid(4),
            local: xid(77),
        };
        assert_eq!(r.local_xid(), xid(77));
        assert_eq!(TransactionRef::Local(xid(5)).local_xid(), xid(5));
    }

    proptest! {
        #[test]
        fn prop_copy_is_equal(
            xmin in 3_u64..1000,
            width in 0_u64..50,
            offsets in proptest::collection::btree_set(0_u64..50, 0..20),
        ) {
            let xmax = xmin + width;
            let running: Vec<_> = offsets
                .into_iter()
                .filter(|o| *o < width)
                .map(|o| xid(xmin + o))
                .collect();
            let snap = Snapshot {
                xmin: xid(xmin),
                xmax: xid(xmax),
                running,
                ..Snapshot::default()
            };
            prop_assert!(snap.is_well_formed());
            let mut copy = Snapshot::default();
            copy.copy_from(&snap);
            prop_assert_eq!(&copy, &snap);
            prop_assert_eq!(copy.fingerprint(), snap.fingerprint());
        }
    }
}
