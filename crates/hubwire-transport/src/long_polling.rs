//! Long-polling transport.
//!
//! Stands in for server push with a loop of long-lived GET requests: each
//! poll returns whatever the server buffered for this connection, or times
//! out quietly and is reissued. Sends are HTTP POSTs through a
//! [`SendQueue`], independent of the poll cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::http::HttpPostSink;
use crate::{
    HttpMethod, Payload, SendQueue, TransferFormat, Transport, TransportError,
    TransportEvents, TransportKind, TransportOptions,
};

#[derive(Default)]
struct PollState {
    url: Option<Url>,
    cancel: Option<CancellationToken>,
    poll: Option<JoinHandle<()>>,
    queue: Option<SendQueue>,
    events: Option<TransportEvents>,
}

/// An HTTP poll loop carrying server-to-client messages.
pub struct LongPollingTransport {
    options: TransportOptions,
    running: Arc<AtomicBool>,
    state: Mutex<PollState>,
}

impl LongPollingTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(PollState::default()),
        }
    }

    /// Returns `true` while the poll loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open(
        &self,
        url: Url,
        format: TransferFormat,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        tracing::debug!(%url, %format, "starting long polling");

        // The first poll establishes the session and must succeed.
        let mut request = self.options.request(HttpMethod::Get, poll_url(&url));
        request.timeout = Some(self.options.poll_timeout);
        let response = self.options.http_client.send(request).await?;
        if response.status != 200 {
            return Err(TransportError::http(
                response.status,
                "long polling connect failed",
            ));
        }

        self.running.store(true, Ordering::SeqCst);
        if !response.body.is_empty() {
            events.receive(to_payload(response.body, format));
        }

        let cancel = CancellationToken::new();
        let poll = tokio::spawn(poll_loop(PollLoop {
            options: self.options.clone(),
            url: url.clone(),
            format,
            events: events.clone(),
            running: self.running.clone(),
            cancel: cancel.clone(),
        }));
        let queue = SendQueue::new(HttpPostSink {
            options: self.options.clone(),
            url: url.clone(),
        });

        let mut state = self.state();
        state.url = Some(url);
        state.cancel = Some(cancel);
        state.poll = Some(poll);
        state.queue = Some(queue);
        state.events = Some(events);
        Ok(())
    }

    async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let PollState {
            url,
            cancel,
            poll,
            queue,
            events,
        } = std::mem::take(&mut *self.state());

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(poll) = poll {
            let _ = poll.await;
        }
        if let Some(queue) = queue {
            queue.stop().await;
        }

        if let Some(url) = url {
            // Best effort: tell the server to drop the session.
            let request = self.options.request(HttpMethod::Delete, url);
            match self.options.http_client.send(request).await {
                Ok(response) if response.is_success() => {
                    tracing::debug!("long polling session deleted");
                }
                Ok(response) => {
                    tracing::debug!(status = response.status, "long polling delete rejected");
                }
                Err(e) => tracing::debug!(error = %e, "long polling delete failed"),
            }
        }

        if let Some(events) = events {
            tracing::debug!("long polling stopped");
            events.close(None);
        }
    }
}

impl Transport for LongPollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPolling
    }

    fn connect(
        &self,
        url: Url,
        format: TransferFormat,
        events: TransportEvents,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.open(url, format, events))
    }

    fn send(&self, payload: Payload) -> BoxFuture<'_, Result<(), TransportError>> {
        // Enqueue now so the write order is the call order.
        let pending = self.state().queue.as_ref().map(|queue| queue.send(payload));
        Box::pin(async move {
            match pending {
                Some(pending) => pending.await,
                None => Err(TransportError::NotConnected),
            }
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.shutdown().await;
            Ok(())
        })
    }
}

struct PollLoop {
    options: TransportOptions,
    url: Url,
    format: TransferFormat,
    events: TransportEvents,
    running: Arc<AtomicBool>,
    cancel: CancellationToken,
}

async fn poll_loop(ctx: PollLoop) {
    while ctx.running.load(Ordering::SeqCst) {
        let mut request = ctx.options.request(HttpMethod::Get, poll_url(&ctx.url));
        request.timeout = Some(ctx.options.poll_timeout);

        let result = tokio::select! {
            () = ctx.cancel.cancelled() => {
                tracing::debug!("poll loop cancelled");
                return;
            }
            result = ctx.options.http_client.send(request) => result,
        };

        match result {
            Ok(response) if response.status == 204 => {
                tracing::info!("long polling session ended by server");
                ctx.running.store(false, Ordering::SeqCst);
                ctx.events.close(None);
            }
            Ok(response) if response.status != 200 => {
                tracing::error!(status = response.status, "unexpected poll status");
                ctx.running.store(false, Ordering::SeqCst);
                ctx.events.close(Some(TransportError::http(
                    response.status,
                    "unexpected response code",
                )));
            }
            Ok(response) => {
                if response.body.is_empty() {
                    tracing::trace!("poll returned no data");
                } else {
                    ctx.events.receive(to_payload(response.body, ctx.format));
                }
            }
            Err(TransportError::Timeout) => {
                tracing::trace!("poll timed out, polling again");
            }
            Err(e) => {
                if ctx.running.swap(false, Ordering::SeqCst) {
                    tracing::error!(error = %e, "poll request failed");
                    ctx.events.close(Some(e));
                }
            }
        }
    }
}

/// Appends a cache-busting timestamp so intermediaries never replay a poll.
fn poll_url(url: &Url) -> Url {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut url = url.clone();
    url.query_pairs_mut().append_pair("_", &millis.to_string());
    url
}

fn to_payload(body: Vec<u8>, format: TransferFormat) -> Payload {
    match format {
        TransferFormat::Text => match String::from_utf8(body) {
            Ok(text) => Payload::Text(text),
            Err(e) => Payload::Text(String::from_utf8_lossy(e.as_bytes()).into_owned()),
        },
        TransferFormat::Binary => Payload::Binary(body),
    }
}
