//! Error taxonomy for the sync engine.

use thiserror::Error;
use tidesync_codec::{CipherError, CodecError, TransportRecord};

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization.
///
/// The taxonomy drives coordinator behavior: transient errors leave work
/// queued for retry, version conflicts resolve automatically, permanent
/// errors drop the operation and are reported once, quota exhaustion backs
/// off without dropping data.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Network failure, throttling, or timeout. Retry with backoff; the
    /// operation stays queued.
    #[error("transient failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// The remote version token has advanced past the one this mutation was
    /// based on. Routed to the conflict resolver, never surfaced to users.
    #[error("version conflict")]
    VersionConflict {
        /// The current authoritative record, when the remote supplied it.
        current: Option<Box<TransportRecord>>,
    },

    /// Schema, auth, or validation failure. The operation is dropped and
    /// reported once; it is not retried.
    #[error("permanent failure: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },

    /// The remote refused for quota reasons. Back off longer; data stays
    /// queued.
    #[error("remote quota exceeded")]
    QuotaExceeded,

    /// A remote operation exceeded its individual timeout. Treated as
    /// transient, never as silent success.
    #[error("operation timed out")]
    Timeout,

    /// The pass was cooperatively cancelled between operations.
    #[error("sync cancelled")]
    Cancelled,

    /// A pass was requested while one is already running for this zone.
    #[error("sync already in progress")]
    SyncInProgress,

    /// Durable sync state (queue, watermark) could not be read or written.
    #[error("state error: {message}")]
    State {
        /// Description of the failure.
        message: String,
    },

    /// Record encoding or decoding failed structurally.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Field cipher failure escalated out of the field-level path.
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
}

impl SyncError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Creates a state error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Returns true if the failed work should be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transient { .. } | SyncError::Timeout | SyncError::QuotaExceeded
        )
    }

    /// Returns true if this failure demands the longer quota backoff floor.
    pub fn is_quota(&self) -> bool {
        matches!(self, SyncError::QuotaExceeded)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::state(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SyncError::transient("connection reset").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::QuotaExceeded.is_retryable());
        assert!(!SyncError::permanent("schema mismatch").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::VersionConflict { current: None }.is_retryable());
    }

    #[test]
    fn quota_classification() {
        assert!(SyncError::QuotaExceeded.is_quota());
        assert!(!SyncError::Timeout.is_quota());
    }

    #[test]
    fn io_errors_become_state_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: SyncError = io.into();
        assert!(matches!(err, SyncError::State { .. }));
    }
}
