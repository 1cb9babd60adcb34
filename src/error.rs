//! Error types for MeshSignal
//!
//! Leaf components return these typed errors; the signal engine maps them
//! into feed states instead of handing them to the presentation layer.

use thiserror::Error;

/// Errors raised by a raw byte transport (BLE link or simulator).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport I/O failed: {0}")]
    Io(String),

    #[error("required endpoint not found: {0}")]
    MissingEndpoint(String),
}

/// Errors raised by a protocol session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// No reply arrived within the request timeout.
    #[error("request {operation} timed out")]
    Timeout { operation: &'static str },

    /// A reply arrived that does not answer the oldest pending request for its tag.
    #[error("unexpected reply for tag {tag}: expected {expected}, got {got}")]
    UnexpectedReply {
        tag: u16,
        expected: String,
        got: String,
    },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("operation {0} is not supported by this radio family")]
    Unsupported(&'static str),

    /// The radio answered with an explicit error code.
    #[error("device rejected request with code {code}")]
    Device { code: u8 },

    #[error("session closed")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised by the connection coordinator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection attempt timed out")]
    Timeout,

    #[error("advertisement does not match any supported radio family")]
    ProtocolMismatch,

    #[error("no radio connected")]
    NotConnected,

    #[error("connection attempt was superseded or disposed")]
    Cancelled,

    #[error("{0} is not supported by the connected radio")]
    Unsupported(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors raised by the persistent key-value collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the cloud content collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloudError {
    #[error("cloud service unavailable")]
    Unavailable,

    #[error("cloud request timed out")]
    Timeout,

    #[error("cloud rejected request: {0}")]
    Rejected(String),

    #[error("network error: {0}")]
    Network(String),
}

/// Errors surfaced by the signal engine to its callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("signal content is empty")]
    EmptyContent,

    #[error("signal content is {len} characters, limit is {max}")]
    ContentTooLong { len: usize, max: usize },

    #[error("ttl of {ttl_secs}s is outside [{min_secs}s, {max_secs}s]")]
    TtlOutOfBounds {
        ttl_secs: i64,
        min_secs: i64,
        max_secs: i64,
    },

    #[error("content rejected by moderation: {0}")]
    Moderated(String),

    #[error("signal {0} not found")]
    NotFound(String),

    #[error("signal {0} has no media awaiting upload")]
    MediaNotPending(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("signal engine has stopped")]
    EngineStopped,
}

/// Errors decoding a signal carried in a mesh packet.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("payload is not a signal")]
    NotASignal,

    #[error("unsupported signal wire version {0}")]
    UnsupportedVersion(u8),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("invalid signal: {0}")]
    Invalid(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_convert_into_connection_errors() {
        let err: ConnectionError = ProtocolError::Timeout { operation: "get_self_info" }.into();
        assert_eq!(
            err,
            ConnectionError::Protocol(ProtocolError::Timeout { operation: "get_self_info" })
        );
        assert_eq!(err.to_string(), "request get_self_info timed out");
    }

    #[test]
    fn ttl_error_names_bounds() {
        let err = SignalError::TtlOutOfBounds {
            ttl_secs: 10,
            min_secs: 60,
            max_secs: 86_400,
        };
        assert_eq!(err.to_string(), "ttl of 10s is outside [60s, 86400s]");
    }
}
