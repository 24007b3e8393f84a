//! Transport abstraction layer for hubwire.
//!
//! Provides the [`Transport`] trait that abstracts over the three ways a
//! hub connection can move framed messages:
//!
//! - [`WebSocketTransport`] — full duplex socket
//! - [`ServerSentEventsTransport`] — server push stream, sends over HTTP POST
//! - [`LongPollingTransport`] — HTTP poll loop, sends over HTTP POST
//!
//! The HTTP-based transports share a [`SendQueue`] so they never issue two
//! writes at once, and they reach the network through the pluggable
//! [`HttpClient`] capability.
//!
//! # Feature Flags
//!
//! - `websocket` (default) — WebSocket transport via `tokio-tungstenite`
//! - `reqwest` (default) — [`ReqwestHttpClient`]

mod error;
mod events;
mod headers;
mod http;
mod long_polling;
mod options;
mod send_queue;
mod server_sent_events;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use events::{TransportEvent, TransportEvents};
pub use headers::{USER_AGENT_HEADER, user_agent};
#[cfg(feature = "reqwest")]
pub use http::ReqwestHttpClient;
pub use http::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpStreamResponse,
};
pub use long_polling::LongPollingTransport;
pub use options::{DEFAULT_HTTP_TIMEOUT, DEFAULT_POLL_TIMEOUT, TransportOptions};
pub use send_queue::{BatchSink, SendQueue};
pub use server_sent_events::ServerSentEventsTransport;
#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;

use std::fmt;
use std::str::FromStr;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use url::Url;

// ---------------------------------------------------------------------------
// Payload and transfer format
// ---------------------------------------------------------------------------

/// One unit of data handed to or received from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    /// Returns `true` if the payload carries no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The payload's bytes, whatever its kind.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// How messages are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferFormat {
    Text,
    Binary,
}

impl fmt::Display for TransferFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("Text"),
            Self::Binary => f.write_str("Binary"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport kinds
// ---------------------------------------------------------------------------

/// The concrete transport mechanisms.
///
/// The string forms match the names servers use in negotiate responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    WebSockets,
    ServerSentEvents,
    LongPolling,
}

impl TransportKind {
    /// All kinds, in default preference order.
    pub const ALL: [TransportKind; 3] = [
        TransportKind::WebSockets,
        TransportKind::ServerSentEvents,
        TransportKind::LongPolling,
    ];

    fn bit(self) -> u8 {
        match self {
            Self::WebSockets => 0b001,
            Self::ServerSentEvents => 0b010,
            Self::LongPolling => 0b100,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSockets => f.write_str("WebSockets"),
            Self::ServerSentEvents => f.write_str("ServerSentEvents"),
            Self::LongPolling => f.write_str("LongPolling"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WebSockets" => Ok(Self::WebSockets),
            "ServerSentEvents" => Ok(Self::ServerSentEvents),
            "LongPolling" => Ok(Self::LongPolling),
            other => Err(TransportError::Connect(format!(
                "unknown transport '{other}'"
            ))),
        }
    }
}

/// A set of permitted [`TransportKind`]s.
///
/// Serializes as a list of kind names so it can live in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<TransportKind>", into = "Vec<TransportKind>")]
pub struct TransportKinds(u8);

impl TransportKinds {
    /// Every transport kind.
    pub const ALL: TransportKinds = TransportKinds(0b111);
    /// No transport kind.
    pub const NONE: TransportKinds = TransportKinds(0);

    /// Returns `true` if `kind` is in the set.
    pub fn contains(self, kind: TransportKind) -> bool {
        self.0 & kind.bit() != 0
    }

    /// Returns the set with `kind` added.
    pub fn with(self, kind: TransportKind) -> Self {
        Self(self.0 | kind.bit())
    }

    /// Returns the single kind in the set, if there is exactly one.
    pub fn single(self) -> Option<TransportKind> {
        let mut kinds = self.iter();
        match (kinds.next(), kinds.next()) {
            (Some(kind), None) => Some(kind),
            _ => None,
        }
    }

    /// Iterates the kinds in the set in preference order.
    pub fn iter(self) -> impl Iterator<Item = TransportKind> {
        TransportKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl Default for TransportKinds {
    fn default() -> Self {
        Self::ALL
    }
}

impl From<TransportKind> for TransportKinds {
    fn from(kind: TransportKind) -> Self {
        Self(kind.bit())
    }
}

impl std::ops::BitOr<TransportKind> for TransportKinds {
    type Output = TransportKinds;

    fn bitor(self, rhs: TransportKind) -> Self::Output {
        self.with(rhs)
    }
}

impl std::ops::BitOr for TransportKind {
    type Output = TransportKinds;

    fn bitor(self, rhs: TransportKind) -> Self::Output {
        TransportKinds::from(self).with(rhs)
    }
}

impl From<Vec<TransportKind>> for TransportKinds {
    fn from(kinds: Vec<TransportKind>) -> Self {
        kinds
            .into_iter()
            .fold(TransportKinds::NONE, TransportKinds::with)
    }
}

impl From<TransportKinds> for Vec<TransportKind> {
    fn from(kinds: TransportKinds) -> Self {
        kinds.iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// A mechanism that moves payloads between client and server.
///
/// Methods return boxed futures so transports can be picked at runtime and
/// held as `Arc<dyn Transport>`. All methods take `&self`; implementations
/// keep their mutable state behind locks so one transport can be shared by
/// the receive task and every sender.
///
/// Inbound data and the close notification are delivered through the
/// [`TransportEvents`] sink handed to [`connect`](Self::connect). A
/// transport fires the close event at most once, whether the close came
/// from the network or from [`stop`](Self::stop).
pub trait Transport: Send + Sync + 'static {
    /// Which mechanism this is.
    fn kind(&self) -> TransportKind;

    /// Connects to `url` using `format`.
    ///
    /// # Errors
    /// Fails if the format is unsupported or the connection cannot be
    /// established. A failed connect never fires the close event.
    fn connect(
        &self,
        url: Url,
        format: TransferFormat,
        events: TransportEvents,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Sends one payload. Only valid while connected.
    fn send(&self, payload: Payload) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Stops the transport. Idempotent.
    fn stop(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_round_trips_through_str() {
        for kind in TransportKind::ALL {
            assert_eq!(kind.to_string().parse::<TransportKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_transport_kind_unknown_name_is_error() {
        assert!("Carrier Pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_transport_kinds_contains_and_single() {
        let kinds = TransportKind::WebSockets | TransportKind::LongPolling;
        assert!(kinds.contains(TransportKind::WebSockets));
        assert!(!kinds.contains(TransportKind::ServerSentEvents));
        assert_eq!(kinds.single(), None);

        let only = TransportKinds::from(TransportKind::LongPolling);
        assert_eq!(only.single(), Some(TransportKind::LongPolling));
        assert_eq!(TransportKinds::NONE.single(), None);
    }

    #[test]
    fn test_transport_kinds_converts_to_ordered_list() {
        let kinds = TransportKind::LongPolling | TransportKind::WebSockets;
        let list: Vec<TransportKind> = kinds.into();
        assert_eq!(
            list,
            vec![TransportKind::WebSockets, TransportKind::LongPolling]
        );
        assert_eq!(TransportKinds::from(list), kinds);
    }

    #[test]
    fn test_payload_len_and_bytes() {
        let text = Payload::Text("abc".into());
        assert_eq!(text.len(), 3);
        assert_eq!(text.into_bytes(), b"abc".to_vec());
        assert!(Payload::Binary(Vec::new()).is_empty());
    }

    #[test]
    fn test_transfer_format_display() {
        assert_eq!(TransferFormat::Binary.to_string(), "Binary");
    }
}
