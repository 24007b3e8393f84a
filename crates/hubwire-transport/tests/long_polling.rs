//! Integration tests for the long-polling transport, driven by a scripted
//! HTTP client.

mod common;

use std::sync::Arc;

use common::{MockHttp, ok};
use hubwire_transport::{
    HttpMethod, LongPollingTransport, Payload, TransferFormat, Transport,
    TransportError, TransportEvent, TransportEvents, TransportOptions,
};
use url::Url;

fn hub_url() -> Url {
    Url::parse("http://localhost:5000/chat?id=abc").unwrap()
}

fn transport(http: &Arc<MockHttp>) -> LongPollingTransport {
    let mut options = TransportOptions::new(http.clone());
    options.access_token = Some("token".into());
    LongPollingTransport::new(options)
}

#[tokio::test]
async fn test_long_polling_forwards_poll_bodies_and_ends_on_204() {
    let (http, control) = MockHttp::new();
    let http = Arc::new(http);
    let lp = transport(&http);
    let (events, mut rx) = TransportEvents::channel();

    // Initial poll establishes the session and carries no data.
    control.gets.send(ok(200, "")).unwrap();
    lp.connect(hub_url(), TransferFormat::Text, events).await.unwrap();
    assert!(lp.is_running());

    control.gets.send(ok(200, "{\"type\":6}\u{1e}")).unwrap();
    assert_eq!(
        rx.recv().await,
        Some(TransportEvent::Received(Payload::Text("{\"type\":6}\u{1e}".into())))
    );

    control.gets.send(ok(204, "")).unwrap();
    assert_eq!(rx.recv().await, Some(TransportEvent::Closed(None)));
    assert!(!lp.is_running());

    // Every poll carried the auth header and a cache buster.
    let gets = http.requests_with(HttpMethod::Get);
    assert_eq!(gets.len(), 3);
    for get in &gets {
        assert_eq!(get.header_value("authorization"), Some("Bearer token"));
        assert!(get.url.query_pairs().any(|(k, _)| k == "_"));
        assert!(get.url.query_pairs().any(|(k, v)| k == "id" && v == "abc"));
    }
}

#[tokio::test]
async fn test_long_polling_initial_non_200_fails_connect_without_close() {
    let (http, control) = MockHttp::new();
    let http = Arc::new(http);
    let lp = transport(&http);
    let (events, mut rx) = TransportEvents::channel();

    control.gets.send(ok(404, "")).unwrap();
    let err = lp
        .connect(hub_url(), TransferFormat::Text, events)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
    assert!(!lp.is_running());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_long_polling_error_status_closes_with_error() {
    let (http, control) = MockHttp::new();
    let http = Arc::new(http);
    let lp = transport(&http);
    let (events, mut rx) = TransportEvents::channel();

    control.gets.send(ok(200, "")).unwrap();
    lp.connect(hub_url(), TransferFormat::Text, events).await.unwrap();

    control.gets.send(ok(500, "")).unwrap();
    match rx.recv().await {
        Some(TransportEvent::Closed(Some(err))) => assert_eq!(err.status(), Some(500)),
        other => panic!("expected error close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_long_polling_timeout_polls_again() {
    let (http, control) = MockHttp::new();
    let http = Arc::new(http);
    let lp = transport(&http);
    let (events, mut rx) = TransportEvents::channel();

    control.gets.send(ok(200, "")).unwrap();
    lp.connect(hub_url(), TransferFormat::Text, events).await.unwrap();

    control.gets.send(Err(TransportError::Timeout)).unwrap();
    control.gets.send(ok(200, "x\u{1e}")).unwrap();
    assert_eq!(
        rx.recv().await,
        Some(TransportEvent::Received(Payload::Text("x\u{1e}".into())))
    );
    assert!(lp.is_running());
    lp.stop().await.unwrap();
}

#[tokio::test]
async fn test_long_polling_stop_cancels_poll_and_deletes_session() {
    let (http, control) = MockHttp::new();
    let http = Arc::new(http);
    let lp = transport(&http);
    let (events, mut rx) = TransportEvents::channel();

    control.gets.send(ok(200, "")).unwrap();
    lp.connect(hub_url(), TransferFormat::Text, events).await.unwrap();

    // A poll is now parked waiting on the scripted client.
    lp.stop().await.unwrap();
    assert!(!lp.is_running());
    assert_eq!(rx.recv().await, Some(TransportEvent::Closed(None)));

    let deletes = http.requests_with(HttpMethod::Delete);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].url, hub_url());

    // Data that shows up after stop is never delivered.
    control.gets.send(ok(200, "late\u{1e}")).unwrap();
    assert_eq!(rx.recv().await, None);

    // Idempotent.
    lp.stop().await.unwrap();
    assert_eq!(http.requests_with(HttpMethod::Delete).len(), 1);
}

#[tokio::test]
async fn test_long_polling_send_posts_payload() {
    let (http, control) = MockHttp::new();
    let http = Arc::new(http);
    let lp = transport(&http);
    let (events, _rx) = TransportEvents::channel();

    assert_eq!(
        lp.send(Payload::Text("early".into())).await,
        Err(TransportError::NotConnected)
    );

    control.gets.send(ok(200, "")).unwrap();
    lp.connect(hub_url(), TransferFormat::Text, events).await.unwrap();
    lp.send(Payload::Text("hello\u{1e}".into())).await.unwrap();

    let posts = http.requests_with(HttpMethod::Post);
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].body.as_deref(), Some("hello\u{1e}".as_bytes()));
    assert_eq!(
        posts[0].header_value("content-type"),
        Some("text/plain;charset=UTF-8")
    );
    lp.stop().await.unwrap();
}
