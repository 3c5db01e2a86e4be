//! Error types for ringkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    // === Protocol Errors ===
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Decode error: {0}")]
    Decode(#[from] bincode::Error),

    // === Limits ===
    #[error("Key cannot be empty")]
    EmptyKey,

    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("Value too long: {len} bytes (max {max})")]
    ValueTooLong { len: usize, max: usize },

    // === Placement Errors ===
    #[error("No node available on the ring")]
    NoNodeAvailable,

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    // === Network Errors ===
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    // === Replication Errors ===
    #[error("Replication to {target} failed after {pushed} entries ({remaining} pending)")]
    Replication {
        target: String,
        pushed: usize,
        remaining: usize,
    },

    // === Coordination Errors ===
    #[error("Launch failed for {node}: {reason}")]
    LaunchFailed { node: String, reason: String },

    #[error("Invalid lifecycle transition for {node}: {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: String,
        to: String,
    },

    #[error("Admin command failed on {node}: {reason}")]
    Admin { node: String, reason: String },

    #[error("Registry error: {0}")]
    Registry(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::ConnectionClosed
                | Error::NoNodeAvailable
                | Error::Io(_)
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::ConnectionClosed.is_retryable());
        assert!(Error::Timeout("x".into()).is_retryable());
        assert!(!Error::EmptyKey.is_retryable());
        assert!(!Error::KeyTooLong { len: 30, max: 20 }.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = Error::Replication {
            target: "node-2".into(),
            pushed: 3,
            remaining: 4,
        };
        assert_eq!(
            err.to_string(),
            "Replication to node-2 failed after 3 entries (4 pending)"
        );
    }
}
