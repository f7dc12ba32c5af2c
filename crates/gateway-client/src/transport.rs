//! Request/response types and the HTTP executor seam.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

/// Unique identifier for requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generate a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a request is an ordinary API call or the credential refresh itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Refresh,
}

/// An outbound API call.
///
/// The `retried` marker is owned by the refresh coordinator and is never
/// reset once set, so a request can trigger at most one refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Unique identifier for this request
    pub id: RequestId,
    /// HTTP method
    pub method: Method,
    /// Path relative to the gateway base URL, or an absolute URL
    pub path: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Option<Bytes>,
    kind: RequestKind,
    retried: bool,
}

impl ApiRequest {
    /// Create a new request.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: RequestId::new(),
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            kind: RequestKind::Standard,
            retried: false,
        }
    }

    /// Create a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Create a POST request.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Create a PUT request.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// Create a PATCH request.
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    /// Create a DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub(crate) fn refresh(path: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Refresh,
            ..Self::post(path)
        }
    }

    /// Add a header to the request.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the request body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the request body as JSON.
    pub fn json<T: Serialize>(mut self, data: &T) -> GatewayResult<Self> {
        self.body = Some(Bytes::from(serde_json::to_vec(data)?));
        self.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Ok(self)
    }

    /// The request kind.
    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Returns `true` if this is the credential refresh call.
    pub fn is_refresh(&self) -> bool {
        self.kind == RequestKind::Refresh
    }

    /// Returns `true` once this request has been replayed after a refresh.
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    pub(crate) fn mark_refresh(&mut self) {
        self.kind = RequestKind::Refresh;
    }

    /// Returns `true` for methods that change server state and therefore
    /// carry the anti-forgery token.
    pub fn is_state_changing(&self) -> bool {
        !matches!(
            self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
        )
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl ApiResponse {
    /// Create a new response.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Add a header to the response.
    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Returns `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> GatewayResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Body as lossy UTF-8 text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Header value as a string, if present and valid.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Performs one raw HTTP exchange.
///
/// Non-success statuses are returned as `Ok`; interpreting them is the
/// gateway's job.
#[async_trait]
pub trait HttpExecutor: Send + Sync + 'static {
    async fn execute(&self, request: &ApiRequest) -> GatewayResult<ApiResponse>;
}

/// [`HttpExecutor`] backed by hyper-util's pooled HTTP/1 client.
#[derive(Clone)]
pub struct HyperExecutor {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: Url,
    timeout: Option<Duration>,
}

impl fmt::Debug for HyperExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HyperExecutor")
            .field("base_url", &self.base_url.as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl HyperExecutor {
    /// Create an executor resolving relative paths against `base_url`.
    pub fn new(base_url: &str) -> GatewayResult<Self> {
        let base_url = Url::parse(base_url)?;
        let client = Client::builder(TokioExecutor::new()).build_http();
        Ok(Self {
            client,
            base_url,
            timeout: None,
        })
    }

    /// Bound every exchange by `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn resolve(&self, path: &str) -> GatewayResult<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(Url::parse(path)?);
        }
        Ok(join_url(&self.base_url, path))
    }

    async fn exchange(&self, request: &ApiRequest) -> GatewayResult<ApiResponse> {
        let url = self.resolve(&request.path)?;
        let mut builder = http::Request::builder()
            .method(request.method.clone())
            .uri(url.as_str());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(request.headers.clone());
        }
        let body = Full::new(request.body.clone().unwrap_or_default());
        let http_request = builder
            .body(body)
            .map_err(|e| GatewayError::transport(format!("Invalid request: {e}")))?;

        let response = self.client.request(http_request).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        debug!(
            request_id = %request.id,
            status = parts.status.as_u16(),
            bytes = body.len(),
            "HTTP exchange complete"
        );

        Ok(ApiResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

#[async_trait]
impl HttpExecutor for HyperExecutor {
    async fn execute(&self, request: &ApiRequest) -> GatewayResult<ApiResponse> {
        match self.timeout {
            Some(duration) => tokio::time::timeout(duration, self.exchange(request))
                .await
                .map_err(|_| GatewayError::timeout(duration))?,
            None => self.exchange(request).await,
        }
    }
}

/// Join `path` onto `base`, keeping any path prefix on the base URL.
pub(crate) fn join_url(base: &Url, path: &str) -> Url {
    let mut joined = base.clone();
    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    let prefix = base.path().trim_end_matches('/');
    let suffix = path.trim_start_matches('/');
    joined.set_path(&format!("{prefix}/{suffix}"));
    joined.set_query(query);
    joined
}
