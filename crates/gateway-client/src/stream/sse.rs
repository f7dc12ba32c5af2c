//! Server-Sent Events push transport over hyper.
//!
//! Only unnamed (`message`) events are forwarded, matching browser
//! `EventSource::onmessage` semantics. `id` and `retry` fields are ignored:
//! reconnection is owned by the subscription state machine.

use std::{fmt, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use http::{HeaderMap, HeaderValue, header};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use tracing::{debug, info};

use super::transport::{PushEvent, PushEvents, PushTransport};

const LF: u8 = b'\n';
const CR: u8 = b'\r';
const BOM: &[u8] = "\u{FEFF}".as_bytes();
const MESSAGE_EVENT: &str = "message";

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub(crate) event: String,
    pub(crate) data: String,
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: BytesMut,
    event: String,
    data: Option<String>,
    bom_checked: bool,
}

impl SseDecoder {
    pub(crate) fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Next complete event, or `None` when more bytes are needed.
    pub(crate) fn next_frame(&mut self) -> Option<SseFrame> {
        if !self.bom_checked {
            if self.buffer.len() < BOM.len() && BOM.starts_with(&self.buffer) {
                return None;
            }
            if self.buffer.starts_with(BOM) {
                self.buffer.advance(BOM.len());
            }
            self.bom_checked = true;
        }

        while let Some((line_end, rem_start)) = find_eol(&self.buffer) {
            let line = self.buffer.split_to(line_end).freeze();
            self.buffer.advance(rem_start - line_end);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    return Some(frame);
                }
                continue;
            }
            self.field(&line);
        }
        None
    }

    fn field(&mut self, line: &Bytes) {
        let line = String::from_utf8_lossy(line);
        if line.starts_with(':') {
            return;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        match name {
            "event" => self.event = value.to_string(),
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = std::mem::take(&mut self.event);
        let data = self.data.take()?;
        Some(SseFrame {
            event: if event.is_empty() {
                MESSAGE_EVENT.to_string()
            } else {
                event
            },
            data,
        })
    }
}

/// Returns `(line_end, remainder_start)`, or `None` if no full line is
/// buffered. A trailing lone CR waits for the next byte, which may be LF.
fn find_eol(bytes: &[u8]) -> Option<(usize, usize)> {
    let pos = memchr::memchr2(CR, LF, bytes)?;
    if bytes[pos] == LF {
        return Some((pos, pos + 1));
    }
    match bytes.get(pos + 1) {
        None => None,
        Some(&LF) => Some((pos, pos + 2)),
        Some(_) => Some((pos, pos + 1)),
    }
}

/// [`PushTransport`] speaking Server-Sent Events over hyper-util's client.
#[derive(Clone)]
pub struct SseTransport {
    client: Client<HttpConnector, Empty<Bytes>>,
    headers: HeaderMap,
    connect_timeout: Duration,
}

impl fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseTransport")
            .field("headers", &self.headers.len())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl Default for SseTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SseTransport {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            headers: HeaderMap::new(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Headers sent with every connection, e.g. a session cookie.
    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Bound the time until the response headers arrive.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn establish(&self, url: &str) -> Result<Incoming, String> {
        let mut builder = http::Request::get(url)
            .header(header::ACCEPT, HeaderValue::from_static("text/event-stream"))
            .header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers.clone());
        }
        let request = builder
            .body(Empty::new())
            .map_err(|e| format!("invalid stream request: {e}"))?;

        let response = tokio::time::timeout(self.connect_timeout, self.client.request(request))
            .await
            .map_err(|_| format!("connect timed out after {:?}", self.connect_timeout))?
            .map_err(|e| format!("connect failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("unexpected status {status}"));
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.contains("text/event-stream") {
            return Err(format!("unexpected content type {content_type:?}"));
        }
        Ok(response.into_body())
    }
}

enum SseState {
    Connect(SseTransport, String),
    Streaming(Incoming, SseDecoder),
    Done,
}

async fn step(state: SseState) -> Option<(PushEvent, SseState)> {
    match state {
        SseState::Connect(transport, url) => match transport.establish(&url).await {
            Ok(body) => {
                info!(url = %url, "Push stream established");
                Some((
                    PushEvent::Open,
                    SseState::Streaming(body, SseDecoder::default()),
                ))
            }
            Err(reason) => Some((PushEvent::Error(reason), SseState::Done)),
        },
        SseState::Streaming(mut body, mut decoder) => loop {
            while let Some(frame) = decoder.next_frame() {
                if frame.event == MESSAGE_EVENT {
                    return Some((
                        PushEvent::Message(frame.data),
                        SseState::Streaming(body, decoder),
                    ));
                }
                debug!(event = %frame.event, "Ignoring named stream event");
            }
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(chunk) = frame.into_data() {
                        decoder.feed(&chunk);
                    }
                }
                Some(Err(e)) => {
                    return Some((PushEvent::Error(format!("read failed: {e}")), SseState::Done));
                }
                None => {
                    return Some((
                        PushEvent::Error("stream ended by server".to_string()),
                        SseState::Done,
                    ));
                }
            }
        },
        SseState::Done => None,
    }
}

impl PushTransport for SseTransport {
    fn open(&self, url: &str) -> PushEvents {
        let initial = SseState::Connect(self.clone(), url.to_string());
        futures_util::stream::unfold(initial, step).boxed()
    }
}
