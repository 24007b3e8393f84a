//! The connection manager: negotiates, then starts the first transport
//! that works.
//!
//! # Start sequence
//!
//! ```text
//! start(format)
//!   ├─ skip_negotiation? ──yes──→ WebSockets on the base URL
//!   │
//!   ├─ POST <url>/negotiate ──→ error field?  → NegotiationFailed
//!   │        ▲                   redirect url? → negotiate again (once)
//!   │        └───────────────────────┘
//!   │
//!   ├─ filter offered transports (permitted kind + supports format)
//!   │        none left → NoCompatibleTransport
//!   │
//!   └─ try each candidate in server order
//!            first success → ConnectedTransport
//!            all failed    → AllTransportsFailed
//! ```

use std::sync::Arc;

use hubwire_transport::{
    HttpClient, HttpMethod, Payload, TransferFormat, Transport, TransportError,
    TransportEvent, TransportEvents, TransportKind, TransportOptions,
};
use tokio::sync::mpsc;
use url::Url;

use crate::negotiate::{connection_url, negotiate_url};
use crate::{
    AccessTokenFactory, AvailableTransport, ConnectionError, ConnectionOptions,
    DefaultTransportFactory, NegotiateResponse, TransportFactory,
};

/// How many times a single start may follow a negotiate redirect.
const MAX_REDIRECTS: usize = 1;

/// A transport that finished connecting, plus what the layer above needs
/// to drive it.
pub struct ConnectedTransport {
    /// The live transport. Shared between the sender and the receive loop.
    pub transport: Arc<dyn Transport>,
    /// Inbound payloads and the single close notification.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    /// The id the server assigned, if negotiation happened.
    pub connection_id: Option<String>,
}

impl ConnectedTransport {
    /// Which transport won.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Sends one payload over the transport.
    pub async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        self.transport.send(payload).await
    }

    /// Stops the transport. Idempotent.
    pub async fn stop(&self) -> Result<(), TransportError> {
        self.transport.stop().await
    }
}

impl std::fmt::Debug for ConnectedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedTransport")
            .field("kind", &self.kind())
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// Negotiates with a hub endpoint and opens a transport to it.
///
/// One `HttpConnection` can be started any number of times; the hub layer
/// calls [`start`](Self::start) again for every reconnect attempt. Nothing
/// from one start carries over to the next.
#[derive(Clone)]
pub struct HttpConnection {
    base_url: Url,
    options: ConnectionOptions,
    http_client: Arc<dyn HttpClient>,
    access_token_factory: Option<Arc<dyn AccessTokenFactory>>,
    transport_factory: Arc<dyn TransportFactory>,
}

impl HttpConnection {
    pub fn new(
        base_url: Url,
        options: ConnectionOptions,
        http_client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            base_url,
            options,
            http_client,
            access_token_factory: None,
            transport_factory: Arc::new(DefaultTransportFactory),
        }
    }

    /// Sets the access-token factory.
    pub fn with_access_token_factory(
        mut self,
        factory: Arc<dyn AccessTokenFactory>,
    ) -> Self {
        self.access_token_factory = Some(factory);
        self
    }

    /// Replaces the transport factory.
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = factory;
        self
    }

    /// The URL this connection negotiates against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Negotiates and connects a transport using `format`.
    ///
    /// # Errors
    /// See [`ConnectionError`]. Individual candidate failures are not
    /// surfaced unless every candidate fails.
    pub async fn start(
        &self,
        format: TransferFormat,
    ) -> Result<ConnectedTransport, ConnectionError> {
        let mut token = self.fetch_access_token().await?;

        if self.options.skip_negotiation {
            if self.options.transports.single() != Some(TransportKind::WebSockets) {
                return Err(ConnectionError::Config(
                    "negotiation can only be skipped when using the WebSocket transport directly"
                        .into(),
                ));
            }
            tracing::debug!(url = %self.base_url, "skipping negotiation");
            let transport_options = self.transport_options(token);
            return self
                .connect(TransportKind::WebSockets, transport_options, self.base_url.clone(), format, None)
                .await
                .map_err(ConnectionError::Transport);
        }

        let mut url = self.base_url.clone();
        let mut redirects = 0;
        let negotiation = loop {
            let response = self.negotiate(&url, token.as_deref()).await?;
            if let Some(error) = &response.error {
                return Err(ConnectionError::NegotiationFailed(error.clone()));
            }
            let Some(redirect) = response.url.clone() else {
                break response;
            };
            if redirects >= MAX_REDIRECTS {
                return Err(ConnectionError::RedirectLimit);
            }
            redirects += 1;
            url = Url::parse(&redirect)
                .map_err(|e| ConnectionError::InvalidUrl(format!("{redirect}: {e}")))?;
            if let Some(redirect_token) = response.access_token {
                token = Some(redirect_token);
            }
            tracing::info!(%url, "negotiate redirected");
        };

        let candidates = self.candidates(&negotiation.available_transports, format);
        if candidates.is_empty() {
            tracing::error!(%format, "no compatible transport offered by the server");
            return Err(ConnectionError::NoCompatibleTransport);
        }

        let connection_id = negotiation.connection_id.clone();
        let target = connection_url(&url, negotiation.connection_token());
        let transport_options = self.transport_options(token);

        let mut failures = Vec::new();
        for kind in candidates {
            match self
                .connect(kind, transport_options.clone(), target.clone(), format, connection_id.clone())
                .await
            {
                Ok(connected) => return Ok(connected),
                Err(e) => {
                    tracing::warn!(transport = %kind, error = %e, "transport failed to start, trying next");
                    failures.push((kind, e));
                }
            }
        }
        Err(ConnectionError::AllTransportsFailed(failures))
    }

    async fn fetch_access_token(&self) -> Result<Option<String>, ConnectionError> {
        let Some(factory) = &self.access_token_factory else {
            return Ok(None);
        };
        let token = factory.access_token().await?;
        Ok(Some(token).filter(|t| !t.is_empty()))
    }

    fn transport_options(&self, token: Option<String>) -> TransportOptions {
        self.options
            .transport_options(self.http_client.clone(), token)
    }

    async fn negotiate(
        &self,
        base: &Url,
        token: Option<&str>,
    ) -> Result<NegotiateResponse, ConnectionError> {
        let url = negotiate_url(base)?;
        tracing::debug!(%url, "sending negotiation request");

        let options = self.transport_options(token.map(str::to_string));
        let response = self
            .http_client
            .send(options.request(HttpMethod::Post, url))
            .await?;
        if !response.is_success() {
            return Err(ConnectionError::Http {
                status: response.status,
                message: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }

        let negotiation: NegotiateResponse = serde_json::from_slice(&response.body)?;
        tracing::debug!(
            connection_id = ?negotiation.connection_id,
            version = negotiation.negotiate_version,
            "negotiation complete"
        );
        Ok(negotiation)
    }

    /// Offered transports this client may use for `format`, in server order.
    fn candidates(
        &self,
        offered: &[AvailableTransport],
        format: TransferFormat,
    ) -> Vec<TransportKind> {
        let mut kinds = Vec::new();
        for available in offered {
            let kind = match available.transport.parse::<TransportKind>() {
                Ok(kind) => kind,
                Err(_) => {
                    tracing::debug!(transport = %available.transport, "skipping unknown transport");
                    continue;
                }
            };
            if !self.options.transports.contains(kind) {
                tracing::debug!(transport = %kind, "transport disabled by the client");
                continue;
            }
            let supports_format = available
                .transfer_formats
                .iter()
                .any(|f| f == &format.to_string());
            if !supports_format {
                tracing::debug!(transport = %kind, %format, "transport does not support the transfer format");
                continue;
            }
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        kinds
    }

    async fn connect(
        &self,
        kind: TransportKind,
        options: TransportOptions,
        url: Url,
        format: TransferFormat,
        connection_id: Option<String>,
    ) -> Result<ConnectedTransport, TransportError> {
        tracing::debug!(transport = %kind, %url, "starting transport");
        let transport = self.transport_factory.create(kind, options)?;
        let (events, rx) = TransportEvents::channel();
        transport.connect(url, format, events).await?;
        tracing::info!(transport = %kind, "transport connected");
        Ok(ConnectedTransport {
            transport,
            events: rx,
            connection_id,
        })
    }
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("base_url", &self.base_url)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
