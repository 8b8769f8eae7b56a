//! Error types for the pool client

use thiserror::Error;

/// Result type for pool client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Pool client errors
///
/// Transient per-node failures (`NodeUnreachable`, `NodeDisconnected`) and
/// per-reply verification failures are normally absorbed by the dispatcher
/// and only show up in `NoConsensus` diagnostics. Callers see the remaining
/// variants directly.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed genesis or configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Pool could not be opened from the supplied genesis
    #[error("Pool open error: {0}")]
    PoolOpen(String),

    /// Appended transaction is not exactly one past the tail
    #[error("Sequence gap: expected sequence number {expected}, found {found}")]
    SequenceGap {
        /// Sequence number the log expected next
        expected: u64,
        /// Sequence number that was offered
        found: u64,
    },

    /// Appended transaction collides with an existing entry
    #[error("Duplicate transaction with sequence number {0}")]
    Duplicate(u64),

    /// Node is not part of the current registry snapshot
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Connection could not be established in time
    #[error("Node {node} unreachable: {reason}")]
    NodeUnreachable {
        /// Node name
        node: String,
        /// Failure detail
        reason: String,
    },

    /// Previously live connection dropped mid-flight
    #[error("Node {node} disconnected: {reason}")]
    NodeDisconnected {
        /// Node name
        node: String,
        /// Failure detail
        reason: String,
    },

    /// Reply or proof could not be decoded
    #[error("Malformed proof: {0}")]
    MalformedProof(String),

    /// Cryptographic check failed
    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    /// Catchup batch failed verification
    #[error("Catchup verification failed: {0}")]
    CatchupVerification(String),

    /// Pool handle has been closed
    #[error("Pool is closed")]
    PoolClosed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transient node-level failure that the dispatcher retries elsewhere
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::NodeUnreachable { .. } | Error::NodeDisconnected { .. }
        )
    }

    pub(crate) fn unreachable(node: &str, reason: impl Into<String>) -> Self {
        Error::NodeUnreachable {
            node: node.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn disconnected(node: &str, reason: impl Into<String>) -> Self {
        Error::NodeDisconnected {
            node: node.to_string(),
            reason: reason.into(),
        }
    }
}
