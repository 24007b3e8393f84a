//! `HubConnectionBuilder`: configures and creates a [`HubConnection`].

use std::sync::Arc;
use std::time::Duration;

use hubwire_connection::{
    AccessTokenFactory, ConnectionOptions, HttpConnection, TransportFactory,
};
use hubwire_protocol::{HubProtocol, JsonHubProtocol};
use hubwire_transport::{HttpClient, ReqwestHttpClient, TransportKinds};
use tracing::Dispatch;
use url::Url;

use crate::hub_connection::Inner;
use crate::{DefaultRetryPolicy, HubConnection, HubError, RetryPolicy};

/// How long the client stays silent before sending a Ping.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// How long the client waits for any message before giving up on the
/// server. Should be at least twice the server's keep-alive interval.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Builder for configuring a [`HubConnection`].
///
/// Only the URL is required. Everything else has a default: the JSON
/// protocol, every transport, a reqwest HTTP client, no reconnection, a
/// 15 second keep-alive, a 30 second server timeout, and the tracing
/// dispatcher that is current when [`build`](Self::build) runs.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use hubwire::prelude::*;
///
/// # fn run() -> Result<(), HubError> {
/// let connection = HubConnectionBuilder::new()
///     .with_url("https://example.com/chat")
///     .with_transports(TransportKind::WebSockets | TransportKind::LongPolling)
///     .with_access_token_factory(|| async { Ok::<_, std::io::Error>("token".to_string()) })
///     .with_automatic_reconnect()
///     .server_timeout(Duration::from_secs(60))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct HubConnectionBuilder {
    url: Option<String>,
    options: ConnectionOptions,
    http_client: Option<Arc<dyn HttpClient>>,
    access_token_factory: Option<Arc<dyn AccessTokenFactory>>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    protocol: Arc<dyn HubProtocol>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    keep_alive_interval: Duration,
    server_timeout: Duration,
    dispatch: Option<Dispatch>,
}

impl HubConnectionBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            url: None,
            options: ConnectionOptions::default(),
            http_client: None,
            access_token_factory: None,
            transport_factory: None,
            protocol: Arc::new(JsonHubProtocol),
            retry_policy: None,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            dispatch: None,
        }
    }

    /// Sets the hub URL (`http`/`https`, or `ws`/`wss` when skipping
    /// negotiation).
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Replaces all connection options at once.
    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Restricts which transports may be used.
    pub fn with_transports(mut self, transports: impl Into<TransportKinds>) -> Self {
        self.options.transports = transports.into();
        self
    }

    /// Connects straight over WebSockets without negotiating.
    pub fn skip_negotiation(mut self, skip: bool) -> Self {
        self.options.skip_negotiation = skip;
        self
    }

    /// Adds a header to every HTTP request and the WebSocket upgrade.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.insert(name.into(), value.into());
        self
    }

    /// Uses `client` for negotiation and the HTTP-based transports.
    pub fn with_http_client(mut self, client: impl HttpClient) -> Self {
        self.http_client = Some(Arc::new(client));
        self
    }

    /// Supplies a bearer token for every connection attempt.
    pub fn with_access_token_factory(mut self, factory: impl AccessTokenFactory) -> Self {
        self.access_token_factory = Some(Arc::new(factory));
        self
    }

    /// Replaces how transports are created.
    pub fn with_transport_factory(mut self, factory: impl TransportFactory) -> Self {
        self.transport_factory = Some(Arc::new(factory));
        self
    }

    /// Replaces the hub protocol.
    pub fn with_protocol(mut self, protocol: impl HubProtocol) -> Self {
        self.protocol = Arc::new(protocol);
        self
    }

    /// Reconnects after an unexpected disconnect, waiting 0, 2, 10 and 30
    /// seconds before the attempts.
    pub fn with_automatic_reconnect(self) -> Self {
        self.with_retry_policy(DefaultRetryPolicy::default())
    }

    /// Reconnects after an unexpected disconnect as `policy` decides.
    pub fn with_retry_policy(mut self, policy: impl RetryPolicy) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    /// Sends this connection's logs to `dispatch` instead of the
    /// dispatcher current at build time.
    pub fn with_logging(mut self, dispatch: impl Into<Dispatch>) -> Self {
        self.dispatch = Some(dispatch.into());
        self
    }

    /// Validates the configuration and creates the connection. Nothing is
    /// sent until [`HubConnection::start`].
    ///
    /// # Errors
    /// Returns [`HubError::Config`] for a missing or unparsable URL, or a
    /// zero keep-alive interval or server timeout.
    pub fn build(self) -> Result<HubConnection, HubError> {
        let url = self
            .url
            .ok_or_else(|| HubError::Config("a hub URL is required".into()))?;
        let url = Url::parse(&url).map_err(|e| HubError::Config(format!("{url}: {e}")))?;

        if self.keep_alive_interval.is_zero() {
            return Err(HubError::Config("keep-alive interval must be positive".into()));
        }
        if self.server_timeout.is_zero() {
            return Err(HubError::Config("server timeout must be positive".into()));
        }
        if self.server_timeout <= self.keep_alive_interval {
            tracing::warn!(
                keep_alive = ?self.keep_alive_interval,
                server_timeout = ?self.server_timeout,
                "server timeout is not longer than the keep-alive interval"
            );
        }

        let http_client = self
            .http_client
            .unwrap_or_else(|| Arc::new(ReqwestHttpClient::new()));
        let mut connection = HttpConnection::new(url, self.options, http_client);
        if let Some(factory) = self.access_token_factory {
            connection = connection.with_access_token_factory(factory);
        }
        if let Some(factory) = self.transport_factory {
            connection = connection.with_transport_factory(factory);
        }

        let dispatch = self
            .dispatch
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone));

        Ok(HubConnection::from_inner(Inner::new(
            connection,
            self.protocol,
            self.retry_policy,
            self.keep_alive_interval,
            self.server_timeout,
            dispatch,
        )))
    }
}

impl Default for HubConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
