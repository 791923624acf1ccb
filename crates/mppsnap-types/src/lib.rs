//! Identifier newtypes and value types shared by the mppsnap crates.
//!
//! Local transaction ids and distributed transaction ids live in separate
//! types on purpose: the two id spaces have no common ordering, and mixing
//! them is a visibility bug.

pub mod cancel;
pub mod dispatch;
pub mod snapshot;

pub use cancel::CancelToken;
pub use dispatch::{DispatchCorrelation, DispatchedStatement, IsolationLevel};
pub use snapshot::{DistributedSnapshot, DistributedVisibility, Snapshot, TransactionRef};

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TransactionId
// ---------------------------------------------------------------------------

/// Local transaction identifier (xid).
///
/// Ids 1 and 2 are reserved for bootstrap and frozen rows; ordinary
/// transactions start at [`TransactionId::FIRST_NORMAL`]. The id space is a
/// plain 64-bit counter, so comparisons are ordinary integer comparisons
/// with no wraparound arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct TransactionId(NonZeroU64);

impl TransactionId {
    /// Largest id the allocator will hand out.
    pub const MAX_RAW: u64 = u64::MAX - 1;

    /// Id stamped on rows created during cluster bootstrap.
    pub const BOOTSTRAP: Self = Self(NonZeroU64::MIN);

    /// Id stamped on frozen rows; visible to everyone.
    pub const FROZEN: Self = Self(NonZeroU64::MIN.saturating_add(1));

    /// First id assigned to an ordinary transaction.
    pub const FIRST_NORMAL: Self = Self(NonZeroU64::MIN.saturating_add(2));

    /// Construct a `TransactionId` if `raw` is in-domain.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        if raw > Self::MAX_RAW {
            return None;
        }
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Whether this id belongs to an ordinary transaction.
    #[inline]
    #[must_use]
    pub const fn is_normal(self) -> bool {
        self.get() >= Self::FIRST_NORMAL.get()
    }

    /// Return the next id if it stays in-domain.
    #[inline]
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        Self::new(self.get().wrapping_add(1))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid#{}", self.get())
    }
}

impl TryFrom<u64> for TransactionId {
    type Error = InvalidTransactionId;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(InvalidTransactionId { raw: value })
    }
}

impl From<TransactionId> for u64 {
    fn from(xid: TransactionId) -> Self {
        xid.get()
    }
}

/// Error returned when constructing an out-of-domain `TransactionId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransactionId {
    raw: u64,
}

impl fmt::Display for InvalidTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid TransactionId {} (must satisfy 1 <= id <= {})",
            self.raw,
            TransactionId::MAX_RAW
        )
    }
}

impl std::error::Error for InvalidTransactionId {}

// ---------------------------------------------------------------------------
// DistributedXid
// ---------------------------------------------------------------------------

/// Cluster-wide transaction identifier assigned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributedXid(NonZeroU64);

impl DistributedXid {
    /// First distributed id handed out after coordinator start.
    pub const FIRST: Self = Self(NonZeroU64::MIN);

    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    #[inline]
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(nz) => Some(Self(nz)),
            None => None,
        }
    }
}

impl fmt::Display for DistributedXid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gxid#{}", self.get())
    }
}

// ---------------------------------------------------------------------------
// Small scalar ids
// ---------------------------------------------------------------------------

/// Command sequence number within a transaction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CommandId(u32);

impl CommandId {
    pub const FIRST: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// The following command id, `None` once the counter is exhausted.
    #[inline]
    #[must_use]
    pub const fn checked_next(self) -> Option<Self> {
        match self.0.checked_add(1) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid {}", self.0)
    }
}

macro_rules! scalar_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u32);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            #[inline]
            #[must_use]
            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

scalar_id!(
    /// Operating-system process id of a backend.
    Pid,
    "pid "
);
scalar_id!(
    /// Database object id.
    DatabaseId,
    "db#"
);
scalar_id!(
    /// Role (user) object id.
    RoleId,
    "role#"
);
scalar_id!(
    /// Coordinator session id shared by every gang member of one session.
    SessionId,
    "session#"
);

/// Identifier of one distributed snapshot, unique per coordinator start.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DistributedSnapshotId(u64);

impl DistributedSnapshotId {
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DistributedSnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dsnap#{}", self.0)
    }
}
