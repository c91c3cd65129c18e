//! Error types for shmcache
//!
//! This module defines the common error taxonomy used throughout the
//! client: hard protocol faults, the two caller-retryable lease
//! conditions, transfer faults, and input contract violations.

use thiserror::Error;

/// Common result type for shmcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for shmcache
#[derive(Debug, Error)]
pub enum Error {
    // Local store errors
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Coordinator protocol errors
    #[error("coordinator protocol fault: {0}")]
    Protocol(String),

    #[error("version conflict on {name}: requested {requested}")]
    VersionConflict { name: String, requested: u64 },

    #[error("lease contended under snapshot isolation: {name}")]
    Contended { name: String },

    // Peer transfer errors
    #[error("peer connection fault: {0}")]
    PeerConnection(String),

    #[error("blob not cached on peer: {0}")]
    PeerMiss(String),

    // Backing store errors
    #[error("backing store error: {0}")]
    BackingStore(String),

    #[error("object not found in backing store: {bucket}/{key}")]
    BackingStoreMiss { bucket: String, key: String },

    // Input contract violations
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Create a protocol fault error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a peer connection fault error
    pub fn peer(msg: impl Into<String>) -> Self {
        Self::PeerConnection(msg.into())
    }

    /// Create a backing store error
    pub fn backing(msg: impl Into<String>) -> Self {
        Self::BackingStore(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Check if the caller may retry the failed operation.
    ///
    /// Version conflicts and snapshot-lease contention are surfaced
    /// immediately but remain retryable at the caller's discretion.
    /// Everything else is fatal.
    #[must_use]
    pub fn is_caller_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::Contended { .. })
    }

    /// Check if this is a not found condition rather than a fault
    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::PeerMiss(_) | Self::BackingStoreMiss { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_retryable() {
        assert!(
            Error::VersionConflict {
                name: "~b~k".into(),
                requested: 3
            }
            .is_caller_retryable()
        );
        assert!(Error::Contended { name: "~b~k".into() }.is_caller_retryable());
        assert!(!Error::protocol("ack count mismatch").is_caller_retryable());
        assert!(!Error::peer("zero-length read").is_caller_retryable());
    }

    #[test]
    fn test_miss_classification() {
        assert!(Error::PeerMiss("b~k".into()).is_miss());
        assert!(
            Error::BackingStoreMiss {
                bucket: "b".into(),
                key: "k".into()
            }
            .is_miss()
        );
        assert!(!Error::protocol("boom").is_miss());
    }
}
