//! Transaction tracking and snapshot construction for one node of a
//! shared-nothing cluster.
//!
//! Shared state (the process array, the gang slot registry, the snapshot
//! builder and the visibility oracle) lives in service objects shared behind
//! `Arc`; everything private to a backend lives in its [`BackendState`].

pub mod backend;
pub mod config;
pub mod distributed;
pub mod observability;
pub mod oracle;
pub mod proc_array;
pub mod shared_snapshot;
pub mod snapshot;
pub mod snapshot_manager;
pub mod visibility;
pub mod xid_gen;

pub use backend::BackendState;
pub use config::{
    DEFAULT_MAX_CACHED_SUBXIDS, MvccConfig, ReaderWaitConfig, SharedSnapshotConfig,
};
pub use distributed::{DistributedSnapshotCoordinator, DtxRole, xid_in_snapshot};
pub use observability::{LookupOutcome, ProcArrayStats, ProcArrayStatsSnapshot};
pub use oracle::{
    CommitLog, DistributedLog, GlobalTransactionDirectory, InMemoryCommitLog,
    InMemoryDistributedLog, InMemoryDtxDirectory, InMemorySubtrans, SubtransAncestry, XidStatus,
};
pub use proc_array::{
    DbUsage, GangMembership, ProcArray, ProcEntry, ProcHandle, SubxidCache, XminCell,
};
pub use shared_snapshot::{SharedLocalSnapshotSlot, SharedSnapshotRegistry, WriterTransaction};
pub use snapshot::SnapshotBuilder;
pub use snapshot_manager::SnapshotManager;
pub use visibility::VisibilityOracle;
pub use xid_gen::XidAllocator;
