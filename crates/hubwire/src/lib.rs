//! # hubwire
//!
//! A real-time hub client: call server methods, receive server calls, and
//! stream data in both directions over whichever transport the server and
//! network allow.
//!
//! hubwire negotiates with the server, picks the first transport that
//! works (WebSockets, then server-sent events, then long polling), runs the
//! protocol handshake, and keeps the connection alive. If the connection
//! drops it can reconnect on its own, following a [`RetryPolicy`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hubwire::prelude::*;
//!
//! # async fn run() -> Result<(), HubError> {
//! let connection = HubConnectionBuilder::new()
//!     .with_url("http://localhost:5000/chat")
//!     .with_automatic_reconnect()
//!     .build()?;
//!
//! connection.on("ReceiveMessage", |args| {
//!     println!("message: {args:?}");
//! });
//! connection.on_close(|error| println!("closed: {error:?}"));
//!
//! connection.start().await?;
//! let echoed = connection.invoke("Echo", vec!["hello".into()]).await?;
//! println!("{echoed}");
//! connection.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crate layout
//!
//! ```text
//! hubwire            ← HubConnection, builder, retry policies, streams
//! hubwire-connection ← negotiation, transport fallback, access tokens
//! hubwire-protocol   ← hub messages, JSON protocol, record framing
//! hubwire-transport  ← WebSockets, server-sent events, long polling
//! ```
//!
//! The sub-crates are re-exported for custom transports, HTTP clients or
//! protocols.

mod builder;
mod driver;
mod error;
mod hub_connection;
mod registry;
mod retry;
mod stream;
mod subject;

pub use builder::{DEFAULT_KEEP_ALIVE_INTERVAL, DEFAULT_SERVER_TIMEOUT, HubConnectionBuilder};
pub use error::HubError;
pub use hub_connection::{HubConnection, HubConnectionState, WeakHubConnection};
pub use retry::{
    DEFAULT_RETRY_DELAYS, DefaultRetryPolicy, ExponentialRetryPolicy, RetryContext, RetryPolicy,
};
pub use stream::HubStream;
pub use subject::{Observer, Subject, Subscription};

pub use hubwire_connection as connection;
pub use hubwire_protocol as protocol;
pub use hubwire_transport as transport;

/// The types most applications need.
pub mod prelude {
    pub use crate::{
        DefaultRetryPolicy, HubConnection, HubConnectionBuilder, HubConnectionState, HubError,
        HubStream, RetryContext, RetryPolicy, Subject,
    };
    pub use hubwire_connection::ConnectionOptions;
    pub use hubwire_transport::{TransportKind, TransportKinds};
    pub use serde_json::{Value, json};
}
