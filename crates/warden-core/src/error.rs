use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no encryption key is installed")]
    KeyNotSet,

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("session expired or locked")]
    SessionExpired,

    #[error("OS credential store unavailable: {0}")]
    VaultUnavailable(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("passphrase too short; minimum {0} characters")]
    WeakPassphrase(usize),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

impl CoreError {
    /// Hard failures that must never be treated as "absent".
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, CoreError::Decryption(_))
    }
}
