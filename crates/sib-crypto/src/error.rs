use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unsupported curve: {0}")]
    UnknownCurve(String),

    #[error("unsupported cipher: {0}")]
    UnknownCipher(String),

    #[error("invalid cipher suite: {0}")]
    InvalidSuite(String),

    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    #[error("encryption failed: {0}")]
    Encryption(&'static str),

    /// Deliberately carries no detail: wrong key and corrupted data look the same.
    #[error("decryption failed: invalid key or corrupted data")]
    Decryption,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("record integrity check failed")]
    Integrity,

    #[error("malformed record: {0}")]
    Record(String),

    #[error("malformed export: {0}")]
    Export(String),
}
