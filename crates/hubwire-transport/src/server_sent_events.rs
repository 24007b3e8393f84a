//! Server-sent events transport.
//!
//! The server pushes messages over a long-lived `text/event-stream`
//! response; the client sends by POSTing through a [`SendQueue`].

use std::sync::{Mutex, PoisonError};

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use tokio::task::JoinHandle;
use url::Url;

use crate::http::HttpPostSink;
use crate::{
    HttpMethod, Payload, SendQueue, TransferFormat, Transport, TransportError,
    TransportEvents, TransportKind, TransportOptions,
};

#[derive(Default)]
struct SseState {
    reader: Option<JoinHandle<()>>,
    queue: Option<SendQueue>,
    events: Option<TransportEvents>,
}

/// A receive-only push stream paired with HTTP POST sends. Text only.
pub struct ServerSentEventsTransport {
    options: TransportOptions,
    state: Mutex<SseState>,
}

impl ServerSentEventsTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            state: Mutex::new(SseState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open(
        &self,
        url: Url,
        format: TransferFormat,
        events: TransportEvents,
    ) -> Result<(), TransportError> {
        if format != TransferFormat::Text {
            return Err(TransportError::UnsupportedTransferFormat(format));
        }

        let mut request = self
            .options
            .request(HttpMethod::Get, url.clone())
            .header("Accept", "text/event-stream");
        // The stream stays open for the life of the connection.
        request.timeout = None;

        tracing::debug!(%url, "opening event stream");
        let response = self.options.http_client.open_stream(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(TransportError::http(
                response.status,
                "event stream request failed",
            ));
        }

        let reader = tokio::spawn(read_loop(response.body, events.clone()));
        let queue = SendQueue::new(HttpPostSink {
            options: self.options.clone(),
            url,
        });

        let mut state = self.state();
        state.reader = Some(reader);
        state.queue = Some(queue);
        state.events = Some(events);
        tracing::info!("event stream connected");
        Ok(())
    }
}

impl Transport for ServerSentEventsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ServerSentEvents
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
            let SseState {
                reader,
                queue,
                events,
            } = std::mem::take(&mut *self.state());

            if let Some(reader) = reader {
                reader.abort();
            }
            if let Some(queue) = queue {
                queue.stop().await;
            }
            if let Some(events) = events {
                tracing::debug!("event stream stopped");
                events.close(None);
            }
            Ok(())
        })
    }
}

async fn read_loop(
    mut body: BoxStream<'static, Result<Vec<u8>, TransportError>>,
    events: TransportEvents,
) {
    let mut parser = SseParser::default();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for data in parser.push(&bytes) {
                    events.receive(Payload::Text(data));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "event stream failed");
                events.close(Some(e));
                return;
            }
        }
    }
    tracing::debug!("event stream ended");
    events.close(None);
}

/// Incremental `text/event-stream` parser.
///
/// Only `data` fields matter here: consecutive `data:` lines are joined
/// with `\n` and the event is dispatched on a blank line. Comments and
/// other fields are ignored; `\r\n` line endings are accepted.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    /// Feeds a chunk and returns the events it completed.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut dispatched = Vec::new();

        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);

            if line.is_empty() {
                if !self.data.is_empty() {
                    dispatched.push(self.data.join("\n"));
                    self.data.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => {
                    (field, value.strip_prefix(' ').unwrap_or(value))
                }
                None => (&*line, ""),
            };
            if field == "data" {
                self.data.push(value.to_string());
            }
        }

        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_parser_single_event() {
        let mut parser = SseParser::default();
        assert_eq!(parser.push(b"data: hello\n\n"), vec!["hello"]);
    }

    #[test]
    fn test_sse_parser_joins_multiline_data() {
        let mut parser = SseParser::default();
        let events = parser.push(b"data: a\ndata: b\n\n");
        assert_eq!(events, vec!["a\nb"]);
    }

    #[test]
    fn test_sse_parser_handles_crlf_and_split_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"data: fir").is_empty());
        assert!(parser.push(b"st\r\n").is_empty());
        assert_eq!(parser.push(b"\r\n"), vec!["first"]);
    }

    #[test]
    fn test_sse_parser_ignores_comments_and_other_fields() {
        let mut parser = SseParser::default();
        let events =
            parser.push(b": keep-alive\nevent: message\nid: 7\ndata:x\n\n\n");
        assert_eq!(events, vec!["x"]);
    }

    #[test]
    fn test_sse_parser_preserves_record_separator() {
        let mut parser = SseParser::default();
        let events = parser.push("data: {\"type\":6}\u{1e}\n\n".as_bytes());
        assert_eq!(events, vec!["{\"type\":6}\u{1e}"]);
    }
}
