//! Wire protocol for hubwire.
//!
//! This crate defines what a hub connection says once a transport is up:
//!
//! - **Types** ([`HubMessage`] and its per-kind payloads) — the RPC-style
//!   messages multiplexed over one connection.
//! - **Framing** ([`TextMessageFormat`]) — `0x1E`-separated text records.
//! - **Handshake** ([`HandshakeProtocol`]) — the first exchange after a
//!   transport connects.
//! - **Codec** ([`HubProtocol`] trait, [`JsonHubProtocol`]) — how messages
//!   are converted to and from transport payloads.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! ```text
//! Transport (Payload) → Protocol (HubMessage) → Hub connection (invocations)
//! ```

mod codec;
mod error;
mod framing;
mod handshake;
mod types;

pub use codec::{HubProtocol, JsonHubProtocol};
pub use error::ProtocolError;
pub use framing::TextMessageFormat;
pub use handshake::{HandshakeProtocol, HandshakeRequest, HandshakeResponse};
pub use types::{
    CancelInvocationMessage, CloseMessage, CompletionMessage,
    CompletionOutcome, HubMessage, InvocationMessage, MessageType,
    StreamInvocationMessage, StreamItemMessage,
};
