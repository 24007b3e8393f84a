//! Connection management for hubwire.
//!
//! This crate turns a hub URL into a live transport:
//!
//! 1. **Negotiation** — asking the server who we are and which transports
//!    it offers ([`NegotiateResponse`])
//! 2. **Selection** — keeping the offered transports the client permits
//!    and that carry the requested transfer format ([`ConnectionOptions`])
//! 3. **Fallback** — trying the candidates in the server's order until one
//!    connects ([`HttpConnection`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Hub Layer (above)  ← runs the handshake and RPC over the connected transport
//!     ↕
//! Connection Layer (this crate)  ← negotiation, transport choice, auth token
//!     ↕
//! Transport Layer (below)  ← WebSocket / server-sent events / long polling
//! ```

mod auth;
mod connection;
mod error;
mod factory;
mod negotiate;
mod options;

pub use auth::AccessTokenFactory;
pub use connection::{ConnectedTransport, HttpConnection};
pub use error::ConnectionError;
pub use factory::{DefaultTransportFactory, TransportFactory};
pub use negotiate::{
    AvailableTransport, NEGOTIATE_VERSION, NegotiateResponse, connection_url,
    negotiate_url,
};
pub use options::ConnectionOptions;
