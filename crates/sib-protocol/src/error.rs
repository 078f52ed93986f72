use std::time::Duration;

use sib_crypto::CryptoError;
use sib_store::StoreError;
use thiserror::Error;

/// The only error text ever sent to a peer.
pub const GENERIC_ERROR: &str = "application protocol error";

pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed or unexpected message
    #[error("framing error: {0}")]
    Framing(String),

    /// Challenge or identity mismatch
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Record fingerprint mismatch
    #[error("record integrity check failed")]
    Integrity,

    /// Unsupported curve or cipher, malformed suite
    #[error("configuration rejected: {0}")]
    Configuration(String),

    /// Account exists / does not exist, unknown index
    #[error("resource error: {0}")]
    Resource(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The peer answered `ERROR;<message>`
    #[error("rejected by peer: {0}")]
    Rejected(String),

    #[error(transparent)]
    Crypto(CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProtocolError {
    /// Whether the connection must be closed after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProtocolError::Integrity)
    }

    /// Status string suitable for a user-facing notification.
    pub fn status(&self) -> String {
        match self {
            ProtocolError::Transport(e) => format!("connection failed: {e}"),
            ProtocolError::Timeout(_) => "server did not answer in time".into(),
            ProtocolError::Cancelled => "disconnected".into(),
            ProtocolError::Rejected(_) => "request rejected by the server".into(),
            other => other.to_string(),
        }
    }
}

impl From<CryptoError> for ProtocolError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Integrity => ProtocolError::Integrity,
            CryptoError::UnknownCurve(_)
            | CryptoError::UnknownCipher(_)
            | CryptoError::InvalidSuite(_) => ProtocolError::Configuration(e.to_string()),
            other => ProtocolError::Crypto(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_integrity_is_recoverable() {
        assert!(!ProtocolError::Integrity.is_fatal());
        assert!(ProtocolError::Framing("x".into()).is_fatal());
        assert!(ProtocolError::Authentication("x".into()).is_fatal());
        assert!(ProtocolError::Resource("x".into()).is_fatal());
        assert!(ProtocolError::Cancelled.is_fatal());
    }

    #[test]
    fn test_crypto_error_mapping() {
        assert!(matches!(
            ProtocolError::from(CryptoError::Integrity),
            ProtocolError::Integrity
        ));
        assert!(matches!(
            ProtocolError::from(CryptoError::UnknownCipher("rc4".into())),
            ProtocolError::Configuration(_)
        ));
        assert!(matches!(
            ProtocolError::from(CryptoError::Decryption),
            ProtocolError::Crypto(_)
        ));
    }
}
