//! In-memory hub server for the connection tests.
//!
//! [`MockHub`] is a transport factory. Every transport it creates connects
//! (or refuses) according to a script, and each successful connect hands
//! the test a [`ServerSide`]: the other end of that transport, which can
//! read what the client wrote and push frames back.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use hubwire::HubConnectionBuilder;
use hubwire::connection::TransportFactory;
use hubwire::transport::{
    HttpClient, HttpRequest, HttpResponse, HttpStreamResponse, Payload, TransferFormat,
    Transport, TransportError, TransportEvents, TransportKind, TransportOptions,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use url::Url;

pub const HUB_URL: &str = "http://localhost:5000/chat";

// =========================================================================
// MockHub
// =========================================================================

#[derive(Default)]
struct HubState {
    /// `false` entries refuse the connect. Empty means accept.
    plan: Mutex<VecDeque<bool>>,
    connects: AtomicUsize,
    accepted: Mutex<Option<mpsc::UnboundedSender<ServerSide>>>,
    stall_sends: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MockHub {
    state: Arc<HubState>,
}

/// Yields a [`ServerSide`] per accepted connect.
pub struct Accepted(mpsc::UnboundedReceiver<ServerSide>);

impl Accepted {
    pub async fn next(&mut self) -> ServerSide {
        self.0.recv().await.expect("mock hub dropped")
    }
}

impl MockHub {
    pub fn new() -> (Self, Accepted) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self::default();
        *hub.state.accepted.lock().unwrap() = Some(tx);
        (hub, Accepted(rx))
    }

    /// Scripts the next connects: `true` accepts, `false` refuses.
    pub fn plan(&self, outcomes: &[bool]) {
        self.state.plan.lock().unwrap().extend(outcomes.iter().copied());
    }

    /// Makes every later client send hang, like a peer that stopped reading.
    pub fn stall_sends(&self) {
        self.state.stall_sends.store(true, Ordering::SeqCst);
    }

    /// How many connects were attempted.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockHub {
    fn create(
        &self,
        kind: TransportKind,
        _options: TransportOptions,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(MockTransport {
            kind,
            hub: self.state.clone(),
            link: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct Link {
    events: TransportEvents,
    to_server: mpsc::UnboundedSender<String>,
}

struct MockTransport {
    kind: TransportKind,
    hub: Arc<HubState>,
    link: Mutex<Option<Link>>,
    stopped: Arc<AtomicBool>,
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn connect(
        &self,
        _url: Url,
        _format: TransferFormat,
        events: TransportEvents,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        self.hub.connects.fetch_add(1, Ordering::SeqCst);
        let accept = self.hub.plan.lock().unwrap().pop_front().unwrap_or(true);
        if !accept {
            return Box::pin(async { Err(TransportError::Connect("refused".into())) });
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        *self.link.lock().unwrap() = Some(Link {
            events: events.clone(),
            to_server,
        });
        let server = ServerSide {
            kind: self.kind,
            events,
            from_client,
            records: VecDeque::new(),
            stopped: self.stopped.clone(),
        };
        if let Some(accepted) = self.hub.accepted.lock().unwrap().as_ref() {
            let _ = accepted.send(server);
        }
        Box::pin(async { Ok(()) })
    }

    fn send(&self, payload: Payload) -> BoxFuture<'_, Result<(), TransportError>> {
        if self.hub.stall_sends.load(Ordering::SeqCst) {
            return Box::pin(futures_util::future::pending());
        }
        let result = match (self.link.lock().unwrap().as_ref(), payload) {
            (Some(link), Payload::Text(text)) => link
                .to_server
                .send(text)
                .map_err(|_| TransportError::SendFailed("server gone".into())),
            (Some(_), Payload::Binary(_)) => Err(TransportError::SendFailed("binary".into())),
            (None, _) => Err(TransportError::NotConnected),
        };
        Box::pin(async move { result })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(link) = self.link.lock().unwrap().take() {
            link.events.close(None);
        }
        Box::pin(async { Ok(()) })
    }
}

// =========================================================================
// ServerSide
// =========================================================================

/// The server's end of one mock transport.
pub struct ServerSide {
    pub kind: TransportKind,
    events: TransportEvents,
    from_client: mpsc::UnboundedReceiver<String>,
    records: VecDeque<String>,
    stopped: Arc<AtomicBool>,
}

impl ServerSide {
    /// The next record the client wrote, parsed. `None` once the client
    /// stopped the transport.
    pub async fn recv(&mut self) -> Option<Value> {
        loop {
            if let Some(record) = self.records.pop_front() {
                return Some(serde_json::from_str(&record).expect("client wrote invalid JSON"));
            }
            let text = self.from_client.recv().await?;
            self.records.extend(
                text.split('\u{1e}')
                    .filter(|r| !r.is_empty())
                    .map(str::to_string),
            );
        }
    }

    /// The next record that is not a Ping.
    pub async fn next_message(&mut self) -> Value {
        loop {
            let message = self.recv().await.expect("client stopped the transport");
            if message != json!({"type": 6}) {
                return message;
            }
        }
    }

    /// Reads the handshake request and accepts it.
    pub async fn accept_handshake(&mut self) {
        let request = self.recv().await.expect("no handshake request");
        assert_eq!(request, json!({"protocol": "json", "version": 1}));
        self.send_raw("{}\u{1e}");
    }

    /// Pushes one message to the client.
    pub fn send(&self, message: Value) {
        self.send_raw(&format!("{message}\u{1e}"));
    }

    pub fn send_raw(&self, frame: &str) {
        self.events.receive(Payload::Text(frame.to_string()));
    }

    /// Closes the transport from the server side.
    pub fn close(&self, error: Option<TransportError>) {
        self.events.close(error);
    }

    /// Whether the client stopped this transport.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

// =========================================================================
// Negotiation
// =========================================================================

/// Answers every negotiate with `transports` and a fresh connection id
/// (`conn-1`, `conn-2`, ...).
#[derive(Debug)]
pub struct NegotiateHttp {
    transports: Vec<&'static str>,
    count: AtomicUsize,
}

impl NegotiateHttp {
    pub fn offering(transports: &[&'static str]) -> Self {
        Self {
            transports: transports.to_vec(),
            count: AtomicUsize::new(0),
        }
    }
}

impl HttpClient for NegotiateHttp {
    fn send(&self, _request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        let available: Vec<Value> = self
            .transports
            .iter()
            .map(|t| json!({"transport": t, "transferFormats": ["Text"]}))
            .collect();
        let body = json!({
            "connectionId": format!("conn-{n}"),
            "connectionToken": format!("token-{n}"),
            "negotiateVersion": 1,
            "availableTransports": available,
        });
        Box::pin(async move {
            Ok(HttpResponse {
                status: 200,
                body: body.to_string().into_bytes(),
            })
        })
    }

    fn open_stream(
        &self,
        _request: HttpRequest,
    ) -> BoxFuture<'_, Result<HttpStreamResponse, TransportError>> {
        Box::pin(async { Err(TransportError::Request("not supported".into())) })
    }
}

// =========================================================================
// Helpers
// =========================================================================

/// A builder that connects straight to the mock hub over "WebSockets".
pub fn builder(hub: &MockHub) -> HubConnectionBuilder {
    HubConnectionBuilder::new()
        .with_url(HUB_URL)
        .with_transports(TransportKind::WebSockets)
        .skip_negotiation(true)
        .with_transport_factory(hub.clone())
}

/// Starts `connection`, answering the handshake on the server side.
pub async fn start(connection: &hubwire::HubConnection, accepted: &mut Accepted) -> ServerSide {
    let starting = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.start().await })
    };
    let mut server = accepted.next().await;
    server.accept_handshake().await;
    starting
        .await
        .expect("start task panicked")
        .expect("start failed");
    server
}

/// Forwards each callback invocation into a channel the test can await.
pub fn channel<T: Send + 'static>() -> (
    impl Fn(T) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<T>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |value| {
        let _ = tx.send(value);
    }, rx)
}
