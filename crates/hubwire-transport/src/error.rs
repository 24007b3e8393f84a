use crate::TransferFormat;

/// Errors that can occur in the transport layer.
///
/// Every variant only carries owned strings and numbers, so the error is
/// `Clone`: the send queue hands the outcome of one physical write to every
/// caller whose payload was part of it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The server answered with a non-success status code.
    #[error("{message} (status code {status})")]
    Http { status: u16, message: String },

    /// A request did not finish within its timeout.
    #[error("request timed out")]
    Timeout,

    /// The HTTP request could not be performed at all.
    #[error("request failed: {0}")]
    Request(String),

    /// The operation needs a connected transport.
    #[error("transport is not connected")]
    NotConnected,

    /// The transport cannot carry the requested transfer format.
    #[error("transport does not support the {0} transfer format")]
    UnsupportedTransferFormat(TransferFormat),

    /// Establishing the connection failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The remote side closed the connection abnormally.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The transport (or its send queue) was stopped.
    #[error("transport stopped")]
    Stopped,

    /// A URL could not be built or parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    /// Shorthand for an [`Http`](Self::Http) error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// The HTTP status code, if this error came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
