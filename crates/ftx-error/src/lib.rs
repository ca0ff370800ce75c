//! Engine-wide error type.
//!
//! Corruption is fatal and carried as [`FtxError::RunRecovery`]; a log-writer
//! I/O failure latches the writer into a panicked state and every later call
//! surfaces [`FtxError::Panicked`].

use thiserror::Error;

/// Convenience alias used by every crate in the workspace.
pub type Result<T> = std::result::Result<T, FtxError>;

/// All errors the transaction core can surface.
#[derive(Debug, Error)]
pub enum FtxError {
    /// The recovery log (or a rollback page) is corrupt. Always fatal.
    #[error("run recovery: {0}")]
    RunRecovery(String),

    /// A record or page failed its checksum.
    #[error("checksum mismatch in {what}: stored {stored:#010x}, computed {computed:#010x}")]
    BadChecksum {
        what: &'static str,
        stored: u32,
        computed: u32,
    },

    /// A log segment carries an incompatible version suffix.
    #[error("incompatible log version {found} (expected {expected})")]
    BadLogVersion { found: u32, expected: u32 },

    /// The log writer previously failed and refuses further work.
    #[error("log writer panicked: {0}")]
    Panicked(i32),

    /// Key already exists (insert-no-overwrite).
    #[error("key already exists")]
    KeyExist,

    /// Key, file, or transaction not found.
    #[error("not found")]
    NotFound,

    /// A conflicting operation is in progress.
    #[error("resource busy")]
    Busy,

    /// Write attempted through a read-only handle.
    #[error("read-only")]
    ReadOnly,

    /// Another process holds the recovery lock.
    #[error("recovery lock held: {0}")]
    RecoveryLockHeld(String),

    /// Invalid argument or state supplied by the caller.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Underlying filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation that the caller cannot recover from.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FtxError {
    /// Shorthand for internal invariant failures.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Shorthand for corruption detected during recovery or apply.
    #[must_use]
    pub fn run_recovery(msg: impl Into<String>) -> Self {
        Self::RunRecovery(msg.into())
    }

    /// Whether this error is a fatal-corruption class error.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::RunRecovery(_) | Self::BadChecksum { .. } | Self::BadLogVersion { .. }
        )
    }
}
