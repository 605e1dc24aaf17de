//! Network error types.

use std::time::Duration;

/// Errors that can occur in the seed_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// Delivery to a node failed after exhausting every retry attempt.
    #[error("Delivery to {node} failed after {attempts} attempt(s): {reason}")]
    Delivery {
        node: String,
        attempts: u32,
        reason: String,
    },

    /// A payload could not be decrypted (wrong key or tampered bytes).
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// A state payload failed its integrity check.
    #[error("Checksum mismatch: {0}")]
    Checksum(String),

    /// A peer presented a missing or invalid token.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// No acknowledgment arrived for a sync prepare in time.
    #[error("State sync with {peer} timed out after {waited:?}")]
    SyncTimeout { peer: String, waited: Duration },

    /// The referenced peer is not in the node registry.
    #[error("Unknown node: {0}")]
    Registry(String),

    /// The peer declined a sync or answered out of protocol.
    #[error("State sync rejected: {0}")]
    SyncRejected(String),

    /// A sync with this peer is already in flight.
    #[error("State sync with {0} already in progress")]
    SyncInProgress(String),

    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was abandoned because the network is shutting down.
    #[error("Operation cancelled")]
    Cancelled,

    /// The agent runtime collaborator reported an error.
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}
