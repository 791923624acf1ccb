//! Node-level sizing and timing knobs.
//!
//! Everything here is fixed at node start: the process array and the shared
//! snapshot slot table are sized once from [`MvccConfig`] and never grow.

use std::path::Path;
use std::time::Duration;

use mppsnap_error::{MppError, Result};
use serde::{Deserialize, Serialize};

/// Default number of subtransaction ids cached per process entry.
pub const DEFAULT_MAX_CACHED_SUBXIDS: usize = 64;

/// Reader-side gang handshake timing.
///
/// `timeout` is the whole liveness bound for a reader waiting on its writer.
/// It is tuned on its own and does not derive from any interconnect setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderWaitConfig {
    /// Give up and fail the statement after this long.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// First wait slice between match checks.
    #[serde(with = "duration_ms")]
    pub initial_poll: Duration,
    /// Upper bound the wait slice backs off to.
    #[serde(with = "duration_ms")]
    pub max_poll: Duration,
    /// Interval between "still waiting" log lines.
    #[serde(with = "duration_ms")]
    pub warn_every: Duration,
}

impl Default for ReaderWaitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            initial_poll: Duration::from_millis(1),
            max_poll: Duration::from_millis(50),
            warn_every: Duration::from_secs(1),
        }
    }
}

/// Shared snapshot slot table sizing and wait bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedSnapshotConfig {
    /// Number of slots; `None` sizes the table to the process array capacity.
    pub slots: Option<usize>,
    /// How long a writer waits for its session's previous slot to be
    /// released, and how long a reader waits for its writer's slot to
    /// appear.
    #[serde(with = "duration_ms")]
    pub wait_timeout: Duration,
}

impl Default for SharedSnapshotConfig {
    fn default() -> Self {
        Self {
            slots: None,
            wait_timeout: Duration::from_secs(10),
        }
    }
}

/// Top-level configuration for the transaction visibility core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MvccConfig {
    pub max_backends: usize,
    pub max_prepared_xacts: usize,
    pub max_cached_subxids: usize,
    /// Upper bound on concurrently running distributed transactions; sizes
    /// the distributed in-progress buffer of every snapshot.
    pub max_distributed_xacts: usize,
    /// Default bound for [`crate::ProcArray::wait_for_db_backends_exit`]
    /// when the caller passes no timeout.
    #[serde(with = "duration_ms")]
    pub db_backend_exit_wait: Duration,
    pub reader_wait: ReaderWaitConfig,
    pub shared_snapshot: SharedSnapshotConfig,
}

impl Default for MvccConfig {
    fn default() -> Self {
        Self {
            max_backends: 100,
            max_prepared_xacts: 50,
            max_cached_subxids: DEFAULT_MAX_CACHED_SUBXIDS,
            max_distributed_xacts: 150,
            db_backend_exit_wait: Duration::from_secs(5),
            reader_wait: ReaderWaitConfig::default(),
            shared_snapshot: SharedSnapshotConfig::default(),
        }
    }
}

impl MvccConfig {
    /// Number of process array slots: backends plus prepared transactions.
    #[must_use]
    pub const fn proc_array_capacity(&self) -> usize {
        self.max_backends + self.max_prepared_xacts
    }

    /// Number of shared snapshot slots.
    #[must_use]
    pub fn shared_snapshot_slots(&self) -> usize {
        self.shared_snapshot
            .slots
            .unwrap_or_else(|| self.proc_array_capacity())
    }

    /// Reject configurations the fixed-size structures cannot be built from.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_backends == 0 {
            return Err(MppError::invalid_config("max_backends must be positive"));
        }
        if u32::try_from(self.proc_array_capacity()).is_err() {
            return Err(MppError::invalid_config(
                "max_backends + max_prepared_xacts must fit in 32 bits",
            ));
        }
        if self.shared_snapshot_slots() == 0 {
            return Err(MppError::invalid_config(
                "shared_snapshot.slots must be positive",
            ));
        }
        let wait = &self.reader_wait;
        if wait.initial_poll.is_zero() || wait.max_poll < wait.initial_poll {
            return Err(MppError::invalid_config(
                "reader_wait.initial_poll must be positive and at most reader_wait.max_poll",
            ));
        }
        if wait.timeout.is_zero() {
            return Err(MppError::invalid_config(
                "reader_wait.timeout must be positive",
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON document. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`MppError::ConfigParse`] for malformed JSON and
    /// [`MppError::InvalidConfig`] when validation fails.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| MppError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures and the errors of [`Self::from_json_str`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        tracing::info!(
            path = %path.display(),
            max_backends = config.max_backends,
            max_prepared_xacts = config.max_prepared_xacts,
            "loaded mvcc configuration"
        );
        Ok(config)
    }
}

/// Durations as integer milliseconds in configuration files.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = MvccConfig::default();
        config.validate().unwrap();
        assert_eq!(config.proc_array_capacity(), 150);
        assert_eq!(config.shared_snapshot_slots(), 150);
        assert_eq!(config.reader_wait.initial_poll, Duration::from_millis(1));
        assert_eq!(config.reader_wait.warn_every, Duration::from_secs(1));
    }

    #[test]
    fn rejects_zero_backends() {
        let config = MvccConfig {
            max_backends: 0,
            ..MvccConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_backends"));
    }

    #[test]
    fn rejects_inverted_poll_bounds() {
        let mut config = MvccConfig::default();
        config.reader_wait.max_poll = Duration::from_micros(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config = MvccConfig::from_json_str(
            r#"{"max_backends": 8, "reader_wait": {"timeout": 250}}"#,
        )
        .unwrap();
        assert_eq!(config.max_backends, 8);
        assert_eq!(config.max_prepared_xacts, 50);
        assert_eq!(config.reader_wait.timeout, Duration::from_millis(250));
        assert_eq!(config.reader_wait.initial_poll, Duration::from_millis(1));
    }

    #[test]
    fn json_round_trip() {
        let config = MvccConfig {
            max_backends: 3,
            shared_snapshot: SharedSnapshotConfig {
                slots: Some(4),
                ..SharedSnapshotConfig::default()
            },
            ..MvccConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(MvccConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = MvccConfig::from_json_str("{max_backends").unwrap_err();
        assert!(matches!(err, MppError::ConfigParse(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"max_backends": 5, "max_prepared_xacts": 2}}"#).unwrap();
        let config = MvccConfig::load(file.path()).unwrap();
        assert_eq!(config.proc_array_capacity(), 7);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MvccConfig::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, MppError::Io(_)));
    }
}
