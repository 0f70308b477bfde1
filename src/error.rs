use std::io;
use thiserror::Error;

/// Errors raised by the transactional store behind the membership table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The transaction lost a lock conflict and must be retried from the top
    #[error("deadlock detected, transaction must be retried")]
    Deadlock,

    #[error("table not found: {0}")]
    NotFound(String),

    #[error("transaction {0} is no longer active")]
    TxnClosed(u64),

    #[error("store I/O failure: {0}")]
    Io(String),
}

/// Errors raised while encoding or decoding membership lists and records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("input truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unsupported format version {0}")]
    UnsupportedFormat(u32),

    #[error("unknown status flags {0:#x}")]
    UnknownStatus(u32),

    #[error("host name is not valid UTF-8")]
    InvalidHost,

    #[error("host name of {0} bytes does not fit the length field")]
    HostTooLong(usize),
}

#[derive(Debug, Error, Clone)]
pub enum RosterError {
    /// Local store failure; the attempt was aborted and compensated
    #[error("Store error: {0}")]
    Store(String),

    #[error("Deadlock retries exhausted after {0} attempts")]
    Deadlock(u32),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Membership manager is shutting down")]
    ShuttingDown,

    /// The local site was removed from the group
    #[error("Local site has been removed from the group")]
    SelfEvicted,
}

pub type Result<T> = std::result::Result<T, RosterError>;

impl RosterError {
    pub fn store(msg: impl Into<String>) -> Self {
        RosterError::Store(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        RosterError::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        RosterError::Config(msg.into())
    }
}

impl From<StoreError> for RosterError {
    fn from(e: StoreError) -> Self {
        RosterError::Store(e.to_string())
    }
}

impl From<CodecError> for RosterError {
    fn from(e: CodecError) -> Self {
        RosterError::Protocol(e.to_string())
    }
}

impl From<io::Error> for RosterError {
    fn from(e: io::Error) -> Self {
        RosterError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RosterError {
    fn from(e: serde_json::Error) -> Self {
        RosterError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for RosterError {
    fn from(e: serde_yaml::Error) -> Self {
        RosterError::Yaml(e.to_string())
    }
}
