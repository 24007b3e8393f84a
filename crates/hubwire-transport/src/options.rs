//! Settings shared by the transports.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::http::{HttpClient, HttpMethod, HttpRequest};
use crate::{USER_AGENT_HEADER, user_agent};

/// Default timeout applied to ordinary HTTP requests.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(100);

/// Default timeout applied to a single long-poll request.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(100);

/// What every transport needs to reach the server.
#[derive(Clone)]
pub struct TransportOptions {
    /// The HTTP capability used for everything except the WebSocket
    /// upgrade itself.
    pub http_client: Arc<dyn HttpClient>,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
    /// Bearer token for the connection, fetched once per start.
    pub access_token: Option<String>,
    pub http_timeout: Duration,
    pub poll_timeout: Duration,
}

impl TransportOptions {
    /// Options with default timeouts and no headers or token.
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            http_client,
            headers: Vec::new(),
            access_token: None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Builds a request carrying the user agent, the bearer token (if any)
    /// and the configured headers.
    pub fn request(&self, method: HttpMethod, url: Url) -> HttpRequest {
        let mut request = HttpRequest::new(method, url)
            .header(USER_AGENT_HEADER, user_agent());
        if let Some(token) = &self.access_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        for (name, value) in &self.headers {
            request = request.header(name.clone(), value.clone());
        }
        request.timeout = Some(self.http_timeout);
        request
    }
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("http_client", &self.http_client)
            .field("headers", &self.headers)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .field("http_timeout", &self.http_timeout)
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HttpResponse, HttpStreamResponse, TransportError};
    use futures_util::future::BoxFuture;

    #[derive(Debug)]
    struct NullClient;

    impl HttpClient for NullClient {
        fn send(
            &self,
            _request: HttpRequest,
        ) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
            Box::pin(async { Err(TransportError::NotConnected) })
        }

        fn open_stream(
            &self,
            _request: HttpRequest,
        ) -> BoxFuture<'_, Result<HttpStreamResponse, TransportError>> {
            Box::pin(async { Err(TransportError::NotConnected) })
        }
    }

    #[test]
    fn test_request_carries_token_and_headers() {
        let mut options = TransportOptions::new(Arc::new(NullClient));
        options.access_token = Some("secret".into());
        options.headers.push(("X-Custom".into(), "1".into()));

        let url = Url::parse("http://localhost/hub").unwrap();
        let request = options.request(HttpMethod::Post, url);

        assert_eq!(request.header_value("authorization"), Some("Bearer secret"));
        assert_eq!(request.header_value("x-custom"), Some("1"));
        assert!(request.header_value("user-agent").is_some());
        assert_eq!(request.timeout, Some(DEFAULT_HTTP_TIMEOUT));
    }

    #[test]
    fn test_debug_redacts_token() {
        let mut options = TransportOptions::new(Arc::new(NullClient));
        options.access_token = Some("secret".into());
        let debug = format!("{options:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("<redacted>"));
    }
}
