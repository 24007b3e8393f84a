//! A scripted in-memory [`HttpClient`] shared by the transport tests.

#![allow(dead_code)]

use std::sync::Mutex;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use hubwire_transport::{
    HttpClient, HttpMethod, HttpRequest, HttpResponse, HttpStreamResponse,
    TransportError,
};
use tokio::sync::mpsc;

type Reply = Result<HttpResponse, TransportError>;
type Chunk = Result<Vec<u8>, TransportError>;

/// GET requests are answered from a channel the test feeds, so a poll stays
/// in flight until the test decides how it ends. POST and DELETE succeed
/// immediately. Every request is recorded.
#[derive(Debug)]
pub struct MockHttp {
    requests: Mutex<Vec<HttpRequest>>,
    gets: tokio::sync::Mutex<mpsc::UnboundedReceiver<Reply>>,
    stream_status: u16,
    stream: Mutex<Option<mpsc::UnboundedReceiver<Chunk>>>,
}

/// The test's side of a [`MockHttp`].
pub struct MockControl {
    pub gets: mpsc::UnboundedSender<Reply>,
    pub chunks: mpsc::UnboundedSender<Chunk>,
}

impl MockHttp {
    pub fn new() -> (Self, MockControl) {
        Self::with_stream_status(200)
    }

    pub fn with_stream_status(stream_status: u16) -> (Self, MockControl) {
        let (gets_tx, gets_rx) = mpsc::unbounded_channel();
        let (chunks_tx, chunks_rx) = mpsc::unbounded_channel();
        let http = Self {
            requests: Mutex::new(Vec::new()),
            gets: tokio::sync::Mutex::new(gets_rx),
            stream_status,
            stream: Mutex::new(Some(chunks_rx)),
        };
        let control = MockControl {
            gets: gets_tx,
            chunks: chunks_tx,
        };
        (http, control)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_with(&self, method: HttpMethod) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }
}

pub fn ok(status: u16, body: &str) -> Reply {
    Ok(HttpResponse {
        status,
        body: body.as_bytes().to_vec(),
    })
}

impl HttpClient for MockHttp {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Reply> {
        let method = request.method;
        self.requests.lock().unwrap().push(request);
        Box::pin(async move {
            match method {
                HttpMethod::Get => {
                    let next = self.gets.lock().await.recv().await;
                    match next {
                        Some(reply) => reply,
                        None => std::future::pending().await,
                    }
                }
                HttpMethod::Post | HttpMethod::Delete => ok(200, ""),
            }
        })
    }

    fn open_stream(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'_, Result<HttpStreamResponse, TransportError>> {
        self.requests.lock().unwrap().push(request);
        let chunks = self.stream.lock().unwrap().take();
        let status = self.stream_status;
        Box::pin(async move {
            let Some(chunks) = chunks else {
                return Err(TransportError::Request("stream already opened".into()));
            };
            let body = futures_util::stream::unfold(chunks, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            })
            .boxed();
            Ok(HttpStreamResponse { status, body })
        })
    }
}
