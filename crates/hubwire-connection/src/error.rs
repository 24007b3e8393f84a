//! Error types for the connection layer.

use hubwire_transport::{TransportError, TransportKind};

/// Errors that can occur while negotiating and starting a transport.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The negotiate response carried an `error` field.
    #[error("failed to complete negotiation with the server: {0}")]
    NegotiationFailed(String),

    /// The negotiate request came back with a non-success status.
    #[error("negotiation failed with status code {status}: {message}")]
    Http { status: u16, message: String },

    /// None of the transports the server offers is permitted here or
    /// supports the requested transfer format.
    #[error("none of the transports supported by the client are supported by the server")]
    NoCompatibleTransport,

    /// Every candidate transport was tried and every one failed.
    ///
    /// Holds the per-candidate errors in the order they were tried.
    #[error("unable to connect to the server with any of the available transports: {}", summarize(.0))]
    AllTransportsFailed(Vec<(TransportKind, TransportError)>),

    /// The server redirected more than once in a single start attempt.
    #[error("negotiate redirection limit exceeded")]
    RedirectLimit,

    /// The connection options are inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The access-token factory failed.
    #[error("access token factory failed: {0}")]
    AccessToken(String),

    /// A URL could not be built or parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The negotiate response body was not valid JSON.
    #[error("invalid negotiate response: {0}")]
    Decode(#[from] serde_json::Error),

    /// A transport failed outside of candidate fallback.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn summarize(attempts: &[(TransportKind, TransportError)]) -> String {
    attempts
        .iter()
        .map(|(kind, error)| format!("{kind} failed: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}
