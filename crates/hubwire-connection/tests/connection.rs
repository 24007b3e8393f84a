//! Integration tests for negotiation and transport fallback.
//!
//! The HTTP client answers negotiate requests from a script, and the
//! transport factory hands out in-memory transports whose connect
//! succeeds or fails per kind, so every path through `start` can be
//! driven without a server.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use hubwire_connection::{ConnectionError, ConnectionOptions, HttpConnection, TransportFactory};
use hubwire_transport::{
    HttpClient, HttpRequest, HttpResponse, HttpStreamResponse, Payload, TransferFormat,
    Transport, TransportError, TransportEvents, TransportKind, TransportOptions,
};
use url::Url;

// =========================================================================
// Mocks
// =========================================================================

#[derive(Debug, Default)]
struct ScriptedHttp {
    replies: Mutex<VecDeque<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttp {
    fn with(replies: Vec<(u16, &str)>) -> Arc<Self> {
        let http = Self::default();
        *http.replies.lock().unwrap() = replies
            .into_iter()
            .map(|(status, body)| HttpResponse {
                status,
                body: body.as_bytes().to_vec(),
            })
            .collect();
        Arc::new(http)
    }

    fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpClient for ScriptedHttp {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, TransportError>> {
        self.requests.lock().unwrap().push(request);
        let reply = self.replies.lock().unwrap().pop_front();
        Box::pin(async move { reply.ok_or_else(|| TransportError::Request("no scripted reply".into())) })
    }

    fn open_stream(
        &self,
        _request: HttpRequest,
    ) -> BoxFuture<'_, Result<HttpStreamResponse, TransportError>> {
        Box::pin(async { Err(TransportError::Request("not scripted".into())) })
    }
}

/// What a mock transport saw when asked to connect.
#[derive(Debug, Clone)]
struct Attempt {
    kind: TransportKind,
    url: Url,
    token: Option<String>,
}

struct MockTransport {
    kind: TransportKind,
    succeed: bool,
    token: Option<String>,
    attempts: Arc<Mutex<Vec<Attempt>>>,
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn connect(
        &self,
        url: Url,
        _format: TransferFormat,
        _events: TransportEvents,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        self.attempts.lock().unwrap().push(Attempt {
            kind: self.kind,
            url,
            token: self.token.clone(),
        });
        let result = if self.succeed {
            Ok(())
        } else {
            Err(TransportError::Connect(format!("{} refused", self.kind)))
        };
        Box::pin(async move { result })
    }

    fn send(&self, _payload: Payload) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    }
}

#[derive(Default)]
struct MockFactory {
    working: Vec<TransportKind>,
    attempts: Arc<Mutex<Vec<Attempt>>>,
}

impl MockFactory {
    fn working(kinds: &[TransportKind]) -> Arc<Self> {
        Arc::new(Self {
            working: kinds.to_vec(),
            ..Self::default()
        })
    }

    fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().unwrap().clone()
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        kind: TransportKind,
        options: TransportOptions,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(MockTransport {
            kind,
            succeed: self.working.contains(&kind),
            token: options.access_token,
            attempts: self.attempts.clone(),
        }))
    }
}

fn hub_url() -> Url {
    Url::parse("http://localhost:5000/chat?tenant=blue").unwrap()
}

const NEGOTIATE_ALL: &str = r#"{
    "connectionId": "cid",
    "connectionToken": "ctoken",
    "negotiateVersion": 1,
    "availableTransports": [
        {"transport": "WebSockets", "transferFormats": ["Text", "Binary"]},
        {"transport": "ServerSentEvents", "transferFormats": ["Text"]},
        {"transport": "LongPolling", "transferFormats": ["Text", "Binary"]}
    ]
}"#;

fn connection(http: &Arc<ScriptedHttp>, factory: &Arc<MockFactory>) -> HttpConnection {
    HttpConnection::new(hub_url(), ConnectionOptions::default(), http.clone())
        .with_transport_factory(factory.clone())
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_start_negotiates_and_uses_first_transport() {
    let http = ScriptedHttp::with(vec![(200, NEGOTIATE_ALL)]);
    let factory = MockFactory::working(&TransportKind::ALL);

    let connected = connection(&http, &factory)
        .start(TransferFormat::Text)
        .await
        .unwrap();

    assert_eq!(connected.kind(), TransportKind::WebSockets);
    assert_eq!(connected.connection_id.as_deref(), Some("cid"));

    let requests = http.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].url.as_str(),
        "http://localhost:5000/chat/negotiate?tenant=blue&negotiateVersion=1"
    );
    assert!(requests[0].header_value("user-agent").is_some());

    let attempts = factory.attempts();
    assert_eq!(attempts.len(), 1);
    assert_eq!(
        attempts[0].url.as_str(),
        "http://localhost:5000/chat?tenant=blue&id=ctoken"
    );
}

#[tokio::test]
async fn test_start_falls_back_silently_to_next_candidate() {
    let body = r#"{
        "connectionToken": "t",
        "negotiateVersion": 1,
        "availableTransports": [
            {"transport": "WebSockets", "transferFormats": ["Text", "Binary"]},
            {"transport": "LongPolling", "transferFormats": ["Text"]}
        ]
    }"#;
    let http = ScriptedHttp::with(vec![(200, body)]);
    let factory = MockFactory::working(&[TransportKind::LongPolling]);

    let connected = connection(&http, &factory)
        .start(TransferFormat::Text)
        .await
        .unwrap();

    assert_eq!(connected.kind(), TransportKind::LongPolling);
    let kinds: Vec<_> = factory.attempts().iter().map(|a| a.kind).collect();
    assert_eq!(kinds, vec![TransportKind::WebSockets, TransportKind::LongPolling]);
}

#[tokio::test]
async fn test_start_filters_by_format_and_permitted_kinds() {
    let http = ScriptedHttp::with(vec![(200, NEGOTIATE_ALL)]);
    let factory = MockFactory::working(&TransportKind::ALL);
    let options = ConnectionOptions {
        transports: TransportKind::ServerSentEvents | TransportKind::LongPolling,
        ..ConnectionOptions::default()
    };

    // Binary rules out server-sent events; WebSockets is not permitted.
    let connected = HttpConnection::new(hub_url(), options, http.clone())
        .with_transport_factory(factory.clone())
        .start(TransferFormat::Binary)
        .await
        .unwrap();

    assert_eq!(connected.kind(), TransportKind::LongPolling);
    assert_eq!(factory.attempts().len(), 1);
}

#[tokio::test]
async fn test_start_no_compatible_transport_is_hard_failure() {
    let body = r#"{"negotiateVersion": 1, "connectionToken": "t",
        "availableTransports": [{"transport": "ServerSentEvents", "transferFormats": ["Text"]}]}"#;
    let http = ScriptedHttp::with(vec![(200, body)]);
    let factory = MockFactory::working(&TransportKind::ALL);

    let err = connection(&http, &factory)
        .start(TransferFormat::Binary)
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectionError::NoCompatibleTransport));
    assert!(factory.attempts().is_empty());
}

#[tokio::test]
async fn test_start_unknown_transport_names_are_skipped() {
    let body = r#"{"negotiateVersion": 1, "connectionToken": "t",
        "availableTransports": [
            {"transport": "CarrierPigeon", "transferFormats": ["Text"]},
            {"transport": "LongPolling", "transferFormats": ["Text"]}
        ]}"#;
    let http = ScriptedHttp::with(vec![(200, body)]);
    let factory = MockFactory::working(&TransportKind::ALL);

    let connected = connection(&http, &factory)
        .start(TransferFormat::Text)
        .await
        .unwrap();
    assert_eq!(connected.kind(), TransportKind::LongPolling);
}

#[tokio::test]
async fn test_start_all_transports_failing_aggregates_errors() {
    let http = ScriptedHttp::with(vec![(200, NEGOTIATE_ALL)]);
    let factory = MockFactory::working(&[]);

    let err = connection(&http, &factory)
        .start(TransferFormat::Text)
        .await
        .unwrap_err();

    match err {
        ConnectionError::AllTransportsFailed(failures) => {
            let kinds: Vec<_> = failures.iter().map(|(k, _)| *k).collect();
            assert_eq!(kinds, TransportKind::ALL.to_vec());
        }
        other => panic!("expected AllTransportsFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_start_negotiate_error_field_fails_immediately() {
    let http = ScriptedHttp::with(vec![(200, r#"{"error": "Hub is closed"}"#)]);
    let factory = MockFactory::working(&TransportKind::ALL);

    let err = connection(&http, &factory)
        .start(TransferFormat::Text)
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectionError::NegotiationFailed(msg) if msg == "Hub is closed"));
    assert!(factory.attempts().is_empty());
}

#[tokio::test]
async fn test_start_negotiate_non_success_status_is_http_error() {
    let http = ScriptedHttp::with(vec![(401, "Unauthorized")]);
    let factory = MockFactory::working(&TransportKind::ALL);

    let err = connection(&http, &factory)
        .start(TransferFormat::Text)
        .await
        .unwrap_err();

    assert!(matches!(err, ConnectionError::Http { status: 401, .. }));
}

#[tokio::test]
async fn test_start_follows_one_redirect_with_new_token() {
    let redirect = r#"{"url": "https://edge.example.com/chat?region=eu", "accessToken": "edge-token"}"#;
    let http = ScriptedHttp::with(vec![(200, redirect), (200, NEGOTIATE_ALL)]);
    let factory = MockFactory::working(&TransportKind::ALL);

    let connected = HttpConnection::new(hub_url(), ConnectionOptions::default(), http.clone())
        .with_transport_factory(factory.clone())
        .with_access_token_factory(Arc::new(|| async {
            Ok::<_, std::convert::Infallible>("app-token".to_string())
        }))
        .start(TransferFormat::Text)
        .await
        .unwrap();
    assert_eq!(connected.kind(), TransportKind::WebSockets);

    let requests = http.requests();
    assert_eq!(requests[0].header_value("authorization"), Some("Bearer app-token"));
    assert_eq!(
        requests[1].url.as_str(),
        "https://edge.example.com/chat/negotiate?region=eu&negotiateVersion=1"
    );
    assert_eq!(requests[1].header_value("authorization"), Some("Bearer edge-token"));

    let attempts = factory.attempts();
    assert_eq!(
        attempts[0].url.as_str(),
        "https://edge.example.com/chat?region=eu&id=ctoken"
    );
    assert_eq!(attempts[0].token.as_deref(), Some("edge-token"));
}

#[tokio::test]
async fn test_start_second_redirect_hits_limit() {
    let redirect = r#"{"url": "https://edge.example.com/chat"}"#;
    let http = ScriptedHttp::with(vec![(200, redirect), (200, redirect)]);
    let factory = MockFactory::working(&TransportKind::ALL);

    let err = connection(&http, &factory)
        .start(TransferFormat::Text)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::RedirectLimit));
}

#[tokio::test]
async fn test_start_skip_negotiation_requires_websockets_only() {
    let http = ScriptedHttp::with(vec![]);
    let factory = MockFactory::working(&TransportKind::ALL);

    let options = ConnectionOptions {
        skip_negotiation: true,
        ..ConnectionOptions::default()
    };
    let err = HttpConnection::new(hub_url(), options, http.clone())
        .with_transport_factory(factory.clone())
        .start(TransferFormat::Text)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectionError::Config(_)));

    let options = ConnectionOptions {
        skip_negotiation: true,
        transports: TransportKind::WebSockets.into(),
        ..ConnectionOptions::default()
    };
    let connected = HttpConnection::new(hub_url(), options, http.clone())
        .with_transport_factory(factory.clone())
        .start(TransferFormat::Text)
        .await
        .unwrap();

    assert_eq!(connected.kind(), TransportKind::WebSockets);
    assert_eq!(connected.connection_id, None);
    assert!(http.requests().is_empty());
    assert_eq!(factory.attempts()[0].url, hub_url());
}

#[tokio::test]
async fn test_start_empty_token_sends_no_authorization() {
    let http = ScriptedHttp::with(vec![(200, NEGOTIATE_ALL)]);
    let factory = MockFactory::working(&TransportKind::ALL);

    connection(&http, &factory)
        .with_access_token_factory(Arc::new(|| async {
            Ok::<_, std::convert::Infallible>(String::new())
        }))
        .start(TransferFormat::Text)
        .await
        .unwrap();

    assert_eq!(http.requests()[0].header_value("authorization"), None);
}
