//! Error types for the protocol layer.
//!
//! Every error in this module means the two ends no longer agree on what
//! is on the wire. None of them are retried: the hub connection treats a
//! `ProtocolError` as fatal and closes.

/// Errors that can occur while framing, parsing, or writing hub messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a message into JSON).
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// A record was not valid JSON.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// A record decoded as JSON but breaks the message rules, e.g. a
    /// Completion carrying both `result` and `error`.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The input did not end with a record separator.
    #[error("message is incomplete")]
    IncompleteRecord,

    /// The payload kind does not match the protocol's transfer format.
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    /// The handshake response was malformed or rejected by the server.
    #[error("handshake failed: {0}")]
    Handshake(String),
}
