//! Values carried from the coordinator to workers alongside a statement.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CommandId, DistributedSnapshot, DistributedXid};

/// Identifies one dispatched statement for the gang handshake.
///
/// The coordinator may send several statements with the same distributed
/// xid and command id; `generation` tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchCorrelation {
    pub coordinator_xid: DistributedXid,
    pub coordinator_cid: CommandId,
    pub generation: u32,
}

impl fmt::Display for DispatchCorrelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/gen {}",
            self.coordinator_xid, self.coordinator_cid, self.generation
        )
    }
}

/// Everything a worker backend receives about the snapshot of a statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchedStatement {
    pub correlation: DispatchCorrelation,
    pub distributed: DistributedSnapshot,
}

/// Transaction isolation level.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Whether one snapshot is held for the whole transaction.
    #[inline]
    #[must_use]
    pub const fn uses_transaction_snapshot(self) -> bool {
        matches!(self, Self::RepeatableRead | Self::Serializable)
    }
}
