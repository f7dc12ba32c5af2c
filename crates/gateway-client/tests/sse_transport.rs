//! SSE transport against a mock hyper server.

use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};

use futures_util::StreamExt;
use gateway_client::stream::{
    NoopObserver, PushEvent, PushTransport, SseTransport, StreamConfig, StreamConsumer,
    StreamStatus,
};
use http::{HeaderMap, HeaderValue};
use http_body_util::Full;
use hyper::{
    Request, Response,
    body::{Bytes, Incoming},
    server::conn::http1,
    service::service_fn,
};
use hyper_util::rt::TokioIo;
use tokio::{net::TcpListener, time::timeout};

const WAIT: Duration = Duration::from_secs(5);

const PLANNER: &str = r#"{"agent":"planner","status":"running","message":"Drafting","timestamp":"2026-03-01T12:00:00Z"}"#;
const CODER: &str = r#"{"agent":"coder","status":"completed","message":"Done","timestamp":"2026-03-01T12:00:05Z","data":{"files":3}}"#;

#[derive(Clone, Copy)]
struct MockOptions {
    content_type: &'static str,
    status: u16,
    /// Header the request must carry; otherwise the server answers 400.
    required_header: Option<(&'static str, &'static str)>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            content_type: "text/event-stream",
            status: 200,
            required_header: None,
        }
    }
}

/// Serve `body` on every accepted connection and close it afterwards.
async fn start_sse_server(body: String, options: MockOptions) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("local addr");
    let body = Arc::new(body);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let body = Arc::clone(&body);
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(move |req: Request<Incoming>| {
                            let accepted = req
                                .headers()
                                .get("accept")
                                .is_some_and(|v| v.to_str().is_ok_and(|s| s == "text/event-stream"));
                            let authorized = options.required_header.is_none_or(|(name, value)| {
                                req.headers()
                                    .get(name)
                                    .is_some_and(|v| v.to_str().is_ok_and(|s| s == value))
                            });
                            let status = if accepted && authorized {
                                options.status
                            } else {
                                400
                            };
                            let resp = Response::builder()
                                .status(status)
                                .header("content-type", options.content_type)
                                .body(Full::new(Bytes::from(body.as_str().to_owned())))
                                .expect("build response");
                            async move { Ok::<_, Infallible>(resp) }
                        }),
                    )
                    .await;
            });
        }
    });

    addr
}

fn sse_body() -> String {
    format!(
        ": connected\n\ndata: {PLANNER}\n\nevent: heartbeat\ndata: {{}}\n\nretry: 1000\r\ndata: {CODER}\r\n\r\n"
    )
}

async fn collect(transport: &SseTransport, url: &str) -> Vec<PushEvent> {
    timeout(WAIT, transport.open(url).collect::<Vec<_>>())
        .await
        .expect("stream finished within timeout")
}

#[tokio::test]
async fn test_messages_are_forwarded_in_order() {
    let addr = start_sse_server(sse_body(), MockOptions::default()).await;
    let transport = SseTransport::new();

    let events = collect(&transport, &format!("http://{addr}/tasks/t-1/stream")).await;

    assert_eq!(events.len(), 4);
    assert_eq!(events[0], PushEvent::Open);
    assert_eq!(events[1], PushEvent::Message(PLANNER.to_string()));
    assert_eq!(events[2], PushEvent::Message(CODER.to_string()));
    // The server closing the response ends the connection with an error.
    assert!(matches!(events[3], PushEvent::Error(_)));
}

#[tokio::test]
async fn test_wrong_content_type_fails() {
    let addr = start_sse_server(
        "{}".to_string(),
        MockOptions {
            content_type: "application/json",
            ..Default::default()
        },
    )
    .await;

    let events = collect(&SseTransport::new(), &format!("http://{addr}/stream")).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], PushEvent::Error(reason) if reason.contains("content type")));
}

#[tokio::test]
async fn test_error_status_fails() {
    let addr = start_sse_server(
        String::new(),
        MockOptions {
            status: 503,
            ..Default::default()
        },
    )
    .await;

    let events = collect(&SseTransport::new(), &format!("http://{addr}/stream")).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], PushEvent::Error(reason) if reason.contains("503")));
}

#[tokio::test]
async fn test_connection_refused_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let events = collect(&SseTransport::new(), &format!("http://{addr}/stream")).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], PushEvent::Error(_)));
}

#[tokio::test]
async fn test_configured_headers_are_sent() {
    let addr = start_sse_server(
        sse_body(),
        MockOptions {
            required_header: Some(("cookie", "session=abc")),
            ..Default::default()
        },
    )
    .await;
    let url = format!("http://{addr}/stream");

    let rejected = collect(&SseTransport::new(), &url).await;
    assert!(matches!(&rejected[0], PushEvent::Error(reason) if reason.contains("400")));

    let mut headers = HeaderMap::new();
    headers.insert("cookie", HeaderValue::from_static("session=abc"));
    let accepted = collect(&SseTransport::new().headers(headers), &url).await;
    assert_eq!(accepted[0], PushEvent::Open);
}

#[tokio::test]
async fn test_consumer_over_sse() {
    let addr = start_sse_server(sse_body(), MockOptions::default()).await;
    let config = StreamConfig::new(format!("http://{addr}/tasks/t-1/stream"))
        .reconnect_interval(Duration::from_millis(20))
        .max_reconnect_attempts(0);

    let consumer = StreamConsumer::open(config, Arc::new(SseTransport::new()), Arc::new(NoopObserver))
        .await
        .expect("spawn");

    // Both messages arrive before the server ends the response; with no
    // reconnects allowed the subscription then closes.
    let mut rx = consumer.subscribe();
    timeout(
        WAIT,
        rx.wait_for(|s| s.status == StreamStatus::Closed && s.last_error.is_some()),
    )
    .await
    .expect("closed within timeout")
    .expect("driver alive");

    let agents: Vec<String> = consumer.messages().into_iter().map(|m| m.agent).collect();
    assert_eq!(agents, vec!["planner", "coder"]);
    assert_eq!(consumer.recent_messages(1)[0].data.as_ref().map(|d| d.len()), Some(1));
}
