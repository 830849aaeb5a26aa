//! Error types for clustermon

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Identity Errors ===
    #[error("Cannot establish local node identity: {0}")]
    NodeIdentity(String),

    // === Gossip Errors ===
    #[error("Malformed gossip patch: {0}")]
    GossipMalformed(String),

    #[error("Consensus timeout")]
    ConsensusTimeout,

    // === Peer Errors ===
    #[error("Peer {node} unreachable: {reason}")]
    PeerUnreachable { node: String, reason: String },

    // === Lookup Errors ===
    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    // === Action Errors ===
    #[error("Failed to spawn action {verb} on {path}: {reason}")]
    ActionSpawn {
        path: String,
        verb: String,
        reason: String,
    },

    #[error("Action {verb} on {path} exited with code {code}")]
    ActionFailed { path: String, verb: String, code: i32 },

    #[error("Status cache unusable for {path}: {reason}")]
    StatusCache { path: String, reason: String },

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Timeout(_)
                | Error::ConsensusTimeout
                | Error::PeerUnreachable { .. }
                | Error::StatusCache { .. }
        )
    }

    /// Errors the daemon cannot survive.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NodeIdentity(_) | Error::InvalidConfig(_))
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::ConsensusTimeout.is_retryable());
        assert!(Error::Timeout("wait".into()).is_retryable());
        assert!(Error::PeerUnreachable {
            node: "n2".into(),
            reason: "connection refused".into(),
        }
        .is_retryable());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_retryable());
        assert!(!Error::UnknownService("svc".into()).is_retryable());
    }

    #[test]
    fn test_fatal() {
        assert!(Error::NodeIdentity("no nodename".into()).is_fatal());
        assert!(!Error::ConsensusTimeout.is_fatal());
    }
}
