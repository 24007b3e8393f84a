//! The HTTP client capability.
//!
//! Negotiation, the long-polling transport and the send side of the
//! server-sent-events transport all ride on [`HttpClient`]. Embedders can
//! supply their own implementation (proxies, custom TLS, test doubles);
//! [`ReqwestHttpClient`] is the default.

use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use url::Url;

use crate::{BatchSink, Payload, TransportError, TransportOptions};

/// The HTTP methods the transports need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("GET"),
            Self::Post => f.write_str("POST"),
            Self::Delete => f.write_str("DELETE"),
        }
    }
}

/// A minimal HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Fails the request with [`TransportError::Timeout`] once elapsed.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// A request with no headers, body, or timeout.
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Adds a header.
    pub fn header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Looks up a request header by name (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A minimal HTTP response with a fully read body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns `true` for 2xx status codes.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A response whose body is consumed incrementally.
pub struct HttpStreamResponse {
    pub status: u16,
    pub body: BoxStream<'static, Result<Vec<u8>, TransportError>>,
}

impl fmt::Debug for HttpStreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStreamResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A minimal async HTTP client.
///
/// Implementations handle the mechanics (TLS, pooling, proxies) while
/// this trait exposes only what the transports need. Non-success statuses
/// are returned as responses, not errors; timeouts must surface as
/// [`TransportError::Timeout`] so the long-polling loop can tell a quiet
/// poll from a broken one.
pub trait HttpClient: fmt::Debug + Send + Sync + 'static {
    /// Sends a request and reads the whole response body.
    fn send(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'_, Result<HttpResponse, TransportError>>;

    /// Sends a request and returns once the response headers arrive. The
    /// body is streamed.
    fn open_stream(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'_, Result<HttpStreamResponse, TransportError>>;
}

// ---------------------------------------------------------------------------
// ReqwestHttpClient
// ---------------------------------------------------------------------------

/// A [`reqwest`]-backed implementation of [`HttpClient`].
#[cfg(feature = "reqwest")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
}

#[cfg(feature = "reqwest")]
impl ReqwestHttpClient {
    /// Creates a client with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a pre-configured `reqwest::Client`.
    pub fn with_client(inner: reqwest::Client) -> Self {
        Self { inner }
    }

    fn build(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self.inner.request(method, request.url);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }
}

#[cfg(feature = "reqwest")]
fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Request(error.to_string())
    }
}

#[cfg(feature = "reqwest")]
impl HttpClient for ReqwestHttpClient {
    fn send(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        use futures_util::FutureExt;

        let builder = self.build(request);
        async move {
            let response = builder.send().await.map_err(map_reqwest_error)?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(map_reqwest_error)?
                .to_vec();
            Ok(HttpResponse { status, body })
        }
        .boxed()
    }

    fn open_stream(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'_, Result<HttpStreamResponse, TransportError>> {
        use futures_util::{FutureExt, StreamExt};

        let builder = self.build(request);
        async move {
            let response = builder.send().await.map_err(map_reqwest_error)?;
            let status = response.status().as_u16();
            let body = response
                .bytes_stream()
                .map(|chunk| {
                    chunk.map(|bytes| bytes.to_vec()).map_err(map_reqwest_error)
                })
                .boxed();
            Ok(HttpStreamResponse { status, body })
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// POST sink
// ---------------------------------------------------------------------------

/// Writes send-queue batches as HTTP POSTs to the connection URL.
#[derive(Debug)]
pub(crate) struct HttpPostSink {
    pub(crate) options: TransportOptions,
    pub(crate) url: Url,
}

impl BatchSink for HttpPostSink {
    fn write(
        &self,
        payload: Payload,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let content_type = match payload {
                Payload::Text(_) => "text/plain;charset=UTF-8",
                Payload::Binary(_) => "application/octet-stream",
            };
            let mut request = self
                .options
                .request(HttpMethod::Post, self.url.clone())
                .header("Content-Type", content_type);
            request.body = Some(payload.into_bytes());

            let response = self.options.http_client.send(request).await?;
            if !response.is_success() {
                return Err(TransportError::http(
                    response.status,
                    "send request failed",
                ));
            }
            Ok(())
        })
    }
}
