//! Unified error type for hubwire.

use std::sync::Arc;

use hubwire_connection::ConnectionError;
use hubwire_protocol::ProtocolError;
use hubwire_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `hubwire` crate you deal with this single error type
/// instead of importing errors from each sub-crate. `From` impls exist for
/// every sub-crate error, so the `?` operator converts them automatically.
///
/// `HubError` is `Clone`: the same close error is handed to every close
/// callback, every pending invocation and the retry policy. Sub-crate errors
/// that are not `Clone` themselves are kept behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HubError {
    /// Negotiation or transport selection failed.
    #[error(transparent)]
    Connection(Arc<ConnectionError>),

    /// A malformed message arrived. Never retried.
    #[error(transparent)]
    Protocol(Arc<ProtocolError>),

    /// The transport failed mid-session.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server rejected the handshake, or closed before answering it.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Nothing was received from the server within the server timeout.
    #[error("server timeout elapsed without receiving a message from the server")]
    Timeout,

    /// `stop()` was called before the connection finished starting.
    #[error("the connection was stopped before it was established")]
    Aborted,

    /// The connection closed while an invocation was still pending.
    #[error("invocation canceled due to the underlying connection being closed{}", detail(.0))]
    ConnectionClosed(Option<String>),

    /// The call is not allowed in the connection's current state.
    #[error("{0}")]
    InvalidState(String),

    /// The server completed an invocation with an error.
    #[error("{0}")]
    Invocation(String),

    /// The server sent a Close message carrying an error.
    #[error("server returned an error on close: {0}")]
    ServerClose(String),

    /// The builder was given inconsistent settings.
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn detail(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(": {r}"))
        .unwrap_or_default()
}

impl From<ConnectionError> for HubError {
    fn from(error: ConnectionError) -> Self {
        Self::Connection(Arc::new(error))
    }
}

impl From<ProtocolError> for HubError {
    fn from(error: ProtocolError) -> Self {
        Self::Protocol(Arc::new(error))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(error: serde_json::Error) -> Self {
        Self::Protocol(Arc::new(ProtocolError::Decode(error)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let hub_err: HubError = err.into();
        assert!(matches!(hub_err, HubError::Transport(_)));
        assert!(hub_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let hub_err: HubError = err.into();
        assert!(matches!(hub_err, HubError::Protocol(_)));
        assert!(hub_err.to_string().contains("bad"));
    }

    #[test]
    fn test_from_connection_error() {
        let err = ConnectionError::NoCompatibleTransport;
        let hub_err: HubError = err.into();
        assert!(matches!(hub_err, HubError::Connection(_)));
    }

    #[test]
    fn test_connection_closed_includes_reason() {
        assert_eq!(
            HubError::ConnectionClosed(None).to_string(),
            "invocation canceled due to the underlying connection being closed"
        );
        assert_eq!(
            HubError::ConnectionClosed(Some("boom".into())).to_string(),
            "invocation canceled due to the underlying connection being closed: boom"
        );
    }

    #[test]
    fn test_hub_error_clone_shares_inner() {
        let err: HubError = ProtocolError::IncompleteRecord.into();
        let clone = err.clone();
        match (err, clone) {
            (HubError::Protocol(a), HubError::Protocol(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("expected protocol errors"),
        }
    }
}
