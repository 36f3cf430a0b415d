use std::io;
use std::result;

use thiserror::Error;

/// Custom result type for ntdb operations
pub type Result<T> = result::Result<T, Error>;

/// ntdb error codes
#[derive(Debug, Error)]
pub enum Error {
    /// A non-blocking lock request would have blocked
    #[error("lock would block")]
    Busy,
    /// The record was not where the caller expected it
    #[error("record not found")]
    NotFound,
    /// The OS refused a lock, or an upgrade gave up
    #[error("lock failed: {0}")]
    Lock(String),
    /// Locking API misuse: unheld unlock, incompatible kinds, use after fork
    #[error("lock misuse: {0}")]
    LockUse(String),
    /// Another handle in this process owns the lock
    #[error("lock owned by another handle in this process: {0}")]
    OwnerConflict(String),
    /// An on-disk invariant does not hold
    #[error("database is corrupt: {0}")]
    Corrupt(String),
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Write attempted on a read-only database
    #[error("database is read-only")]
    ReadOnly,
    /// Bad argument from the caller
    #[error("invalid argument: {0}")]
    Invalid(String),
}

impl Error {
    /// Expected contention rather than a real failure.
    ///
    /// Best-effort paths (coalescing) back off on these and keep going.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Busy | Error::OwnerConflict(_))
    }

    /// Whether this error means the file itself is damaged.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, Error::Corrupt(_))
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::error!("{}", msg);
        Error::Corrupt(msg)
    }

    pub(crate) fn lock_use(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::warn!("{}", msg);
        Error::LockUse(msg)
    }

    pub(crate) fn owner_conflict(call: &str) -> Self {
        log::warn!("{}: lock owned by another handle in this process", call);
        Error::OwnerConflict(call.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_is_not_corruption() {
        assert!(Error::Busy.is_contention());
        assert!(Error::OwnerConflict("x".into()).is_contention());
        assert!(!Error::Lock("x".into()).is_contention());
        assert!(!Error::Busy.is_corrupt());
        assert!(Error::Corrupt("bad magic".into()).is_corrupt());
    }

    #[test]
    fn io_errors_convert() {
        let err: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("boom"));
    }
}
