use std::time::Duration;

use thiserror::Error;

/// Primary error type for the transaction visibility core.
///
/// Variants carry enough context to render the same diagnostics the
/// coordinator surfaces to clients; [`MppError::sql_state`] maps each one to
/// the five-character SQLSTATE reported on the wire.
#[derive(Error, Debug)]
pub enum MppError {
    // === Capacity ===
    /// The process array is full.
    #[error("sorry, too many clients already (capacity {capacity})")]
    TooManyClients { capacity: usize },

    /// The shared local snapshot slot table is full.
    #[error("sorry, too many clients already: no free shared snapshot slot (capacity {capacity})")]
    SharedSnapshotSlotsExhausted { capacity: usize },

    /// The transaction id counter ran out of normal ids.
    #[error("database is not accepting commands: transaction id space exhausted at {last}")]
    XidExhausted { last: u64 },

    // === Registration ===
    /// A backend with the same pid is already registered.
    #[error("backend pid {pid} is already registered in the process array")]
    DuplicateBackend { pid: u32 },

    /// The handle no longer names a live process entry.
    #[error("stale process handle (slot {index}, generation {generation})")]
    StaleHandle { index: u32, generation: u32 },

    // === Gang handshake ===
    /// A writer tried to claim a slot already owned by its session.
    #[error("writer gang shared snapshot collision on session {session}")]
    SharedSnapshotCollision { session: u32 },

    /// A reader could not find its gang's slot.
    #[error("could not find shared local snapshot for session {session}")]
    SharedSnapshotNotFound { session: u32 },

    /// A reader gave up waiting for its writer to publish.
    #[error(
        "timed out after {waited:?} waiting for writer to set the shared snapshot: \
         expected {expected}, slot holds {published}"
    )]
    ReaderSnapshotTimeout {
        waited: Duration,
        expected: String,
        published: String,
    },

    // === Snapshot management ===
    /// `latest_snapshot` was called before any transaction snapshot.
    #[error("no snapshot has been set")]
    NoSnapshotSet,

    /// The backend role does not allow this operation.
    #[error("operation not valid for {role} backend: {detail}")]
    WrongRole { role: &'static str, detail: String },

    // === Interrupts ===
    /// Cancellation observed at a checkpoint.
    #[error("canceling statement due to user request")]
    QueryCanceled,

    // === Configuration ===
    /// Configuration failed validation.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// Configuration could not be parsed.
    #[error("configuration parse error: {0}")]
    ConfigParse(String),

    /// File I/O error while loading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Internal ===
    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// SQLSTATE classes reported for errors raised by this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlState {
    /// `53300`
    TooManyConnections,
    /// `54000`
    ProgramLimitExceeded,
    /// `57014`
    QueryCanceled,
    /// `58M01`, interconnect failure between gang members.
    InterconnectionError,
    /// `55000`
    ObjectNotInPrerequisiteState,
    /// `F0000`
    ConfigFileError,
    /// `58030`
    IoError,
    /// `XX000`
    InternalError,
}

impl SqlState {
    /// The five-character SQLSTATE code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::TooManyConnections => "53300",
            Self::ProgramLimitExceeded => "54000",
            Self::QueryCanceled => "57014",
            Self::InterconnectionError => "58M01",
            Self::ObjectNotInPrerequisiteState => "55000",
            Self::ConfigFileError => "F0000",
            Self::IoError => "58030",
            Self::InternalError => "XX000",
        }
    }
}

/// How far an error unwinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Aborts the current statement; the backend survives.
    Error,
    /// Terminates the backend or connection attempt.
    Fatal,
}

impl MppError {
    /// Map this error to its SQLSTATE.
    #[allow(clippy::match_same_arms)]
    pub const fn sql_state(&self) -> SqlState {
        match self {
            Self::TooManyClients { .. } | Self::SharedSnapshotSlotsExhausted { .. } => {
                SqlState::TooManyConnections
            }
            Self::XidExhausted { .. } => SqlState::ProgramLimitExceeded,
            Self::DuplicateBackend { .. } | Self::StaleHandle { .. } => SqlState::InternalError,
            Self::SharedSnapshotCollision { .. } => SqlState::InternalError,
            Self::SharedSnapshotNotFound { .. } | Self::ReaderSnapshotTimeout { .. } => {
                SqlState::InterconnectionError
            }
            Self::NoSnapshotSet | Self::WrongRole { .. } => {
                SqlState::ObjectNotInPrerequisiteState
            }
            Self::QueryCanceled => SqlState::QueryCanceled,
            Self::InvalidConfig { .. } | Self::ConfigParse(_) => SqlState::ConfigFileError,
            Self::Io(_) => SqlState::IoError,
            Self::Internal(_) => SqlState::InternalError,
        }
    }

    /// Severity at which the error is reported.
    ///
    /// Capacity exhaustion at connection time and a writer slot collision end
    /// the backend. Everything else, including the reader handshake timeout,
    /// fails only the current statement.
    pub const fn severity(&self) -> Severity {
        match self {
            Self::TooManyClients { .. }
            | Self::SharedSnapshotSlotsExhausted { .. }
            | Self::SharedSnapshotCollision { .. }
            | Self::DuplicateBackend { .. } => Severity::Fatal,
            _ => Severity::Error,
        }
    }

    /// Shorthand for `severity() == Severity::Fatal`.
    pub const fn is_fatal(&self) -> bool {
        matches!(self.severity(), Severity::Fatal)
    }

    /// Whether this is a transient error that may succeed on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TooManyClients { .. }
                | Self::SharedSnapshotSlotsExhausted { .. }
                | Self::ReaderSnapshotTimeout { .. }
                | Self::SharedSnapshotNotFound { .. }
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::TooManyClients { .. } => {
                Some("Raise max_backends or close idle connections, then reconnect")
            }
            Self::SharedSnapshotSlotsExhausted { .. } => {
                Some("A gang is not releasing its shared snapshot slot; check for stuck writers")
            }
            Self::ReaderSnapshotTimeout { .. } => Some(
                "The writer gang member did not publish in time; rerun the statement or raise the reader wait timeout",
            ),
            Self::SharedSnapshotNotFound { .. } => {
                Some("The writer gang member exited or was never started for this session")
            }
            Self::NoSnapshotSet => Some("Take a transaction snapshot before asking for the latest one"),
            Self::XidExhausted { .. } => Some("Vacuum the database to reclaim transaction ids"),
            _ => None,
        }
    }

    /// Construct an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Construct an invalid configuration error.
    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// Construct a wrong-role error.
    pub fn wrong_role(role: &'static str, detail: impl Into<String>) -> Self {
        Self::WrongRole {
            role,
            detail: detail.into(),
        }
    }
}

/// Result type alias using `MppError`.
pub type Result<T> = std::result::Result<T, MppError>;
