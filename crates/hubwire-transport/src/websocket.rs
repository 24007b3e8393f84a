//! WebSocket transport implementation using `tokio-tungstenite`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::{
    Payload, TransferFormat, Transport, TransportError, TransportEvents,
    TransportKind, TransportOptions, USER_AGENT_HEADER, user_agent,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// How long a background close waits for an in-flight send to give up
/// the sink.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A full-duplex [`Transport`] over a single WebSocket.
///
/// Both transfer formats are supported: text payloads travel as text
/// frames and binary payloads as binary frames.
///
/// Reads run on their own task; writes take turns on the sink. A send
/// that the peer never drains holds the sink, so [`stop`](Transport::stop)
/// reports the close immediately and leaves the close frame to a
/// background task.
pub struct WebSocketTransport {
    options: TransportOptions,
    sink: Arc<Mutex<Option<WsSink>>>,
    stopped: AtomicBool,
    reader: StdMutex<Option<JoinHandle<()>>>,
    events: StdMutex<Option<TransportEvents>>,
}

impl WebSocketTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            sink: Arc::new(Mutex::new(None)),
            stopped: AtomicBool::new(false),
            reader: StdMutex::new(None),
            events: StdMutex::new(None),
        }
    }

    /// Turns an `http(s)` connection URL into the `ws(s)` URL to dial,
    /// carrying the access token as a query parameter.
    fn socket_url(&self, mut url: Url) -> Result<Url, TransportError> {
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(TransportError::InvalidUrl(format!(
                    "unsupported scheme '{other}'"
                )));
            }
        };
        url.set_scheme(scheme).map_err(|()| {
            TransportError::InvalidUrl(format!("cannot switch to {scheme}"))
        })?;

        if let Some(token) = &self.options.access_token {
            url.query_pairs_mut().append_pair("access_token", token);
        }
        Ok(url)
    }

    async fn open(
        &self,
        url: Url,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        let url = self.socket_url(url)?;
        tracing::debug!(%url, "connecting WebSocket");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let headers = request.headers_mut();
        let extra = std::iter::once((USER_AGENT_HEADER.to_string(), user_agent()))
            .chain(self.options.headers.iter().cloned());
        for (name, value) in extra {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping invalid header"),
            }
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = ws.split();

        *self.sink.lock().await = Some(sink);
        self.stopped.store(false, Ordering::Release);
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(events.clone());
        let reader = tokio::spawn(read_loop(stream, events));
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(reader);

        tracing::info!("WebSocket connected");
        Ok(())
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSockets
    }

    fn connect(
        &self,
        url: Url,
        _format: TransferFormat,
        events: TransportEvents,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.open(url, events))
    }

    fn send(&self, payload: Payload) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if self.stopped.load(Ordering::Acquire) {
                return Err(TransportError::NotConnected);
            }
            let mut guard = self.sink.lock().await;
            let Some(sink) = guard.as_mut() else {
                return Err(TransportError::NotConnected);
            };
            if self.stopped.load(Ordering::Acquire) {
                return Err(TransportError::NotConnected);
            }
            let message = match payload {
                Payload::Text(text) => Message::Text(text.into()),
                Payload::Binary(bytes) => Message::Binary(bytes.into()),
            };
            sink.send(message)
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let reader = self
                .reader
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(reader) = reader {
                reader.abort();
            }

            self.stopped.store(true, Ordering::Release);

            let events = self
                .events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(events) = events {
                tracing::debug!("WebSocket stopped");
                events.close(None);
            }

            // A pending send may own the sink for a long time, so the
            // close frame goes out from a background task.
            let sink = Arc::clone(&self.sink);
            tokio::spawn(async move {
                let close = async {
                    let Some(mut sink) = sink.lock().await.take() else {
                        return;
                    };
                    if let Err(e) = sink.close().await {
                        tracing::debug!(error = %e, "WebSocket close frame not sent");
                    }
                };
                if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
                    tracing::debug!("gave up closing a stalled WebSocket");
                }
            });
            Ok(())
        })
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, events: TransportEvents) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                events.receive(Payload::Text(text.as_str().to_owned()));
            }
            Ok(Message::Binary(bytes)) => {
                events.receive(Payload::Binary(bytes.to_vec()));
            }
            Ok(Message::Close(frame)) => {
                let error = frame.and_then(close_error);
                match &error {
                    Some(e) => tracing::warn!(error = %e, "WebSocket closed by server"),
                    None => tracing::debug!("WebSocket closed by server"),
                }
                events.close(error);
                return;
            }
            Ok(_) => {} // ping/pong/frame
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket receive failed");
                events.close(Some(TransportError::ReceiveFailed(e.to_string())));
                return;
            }
        }
    }
    events.close(None);
}

fn close_error(frame: CloseFrame) -> Option<TransportError> {
    if frame.code == CloseCode::Normal {
        return None;
    }
    let code = u16::from(frame.code);
    Some(TransportError::ConnectionClosed(format!(
        "WebSocket closed with status code: {code} ({})",
        frame.reason.as_str()
    )))
}
