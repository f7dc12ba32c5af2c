//! The request gateway wrapping every outbound API call.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use http::{HeaderName, HeaderValue, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    classify::{CSRF_HEADER, ErrorClassification},
    error::{GatewayError, GatewayResult},
    refresh::RefreshCoordinator,
    router::SessionRouter,
    session::CsrfTokenSource,
    transport::{ApiRequest, ApiResponse, HttpExecutor, HyperExecutor},
};

/// Configuration for the request gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Base URL for all requests
    pub base_url: String,
    /// Path of the credential refresh endpoint
    pub refresh_path: String,
    /// Upper bound on one refresh call; expiry counts as refresh failure
    pub refresh_timeout: Duration,
    /// Per-request timeout applied by [`HyperExecutor`]
    pub request_timeout: Option<Duration>,
    /// Default headers to include with all requests
    pub default_headers: HashMap<String, String>,
}

impl GatewayConfig {
    /// Create a new gateway configuration with defaults.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh_path: "/auth/refresh".to_string(),
            refresh_timeout: Duration::from_secs(30),
            request_timeout: None,
            default_headers: HashMap::new(),
        }
    }

    /// Set the refresh endpoint path.
    #[must_use]
    pub fn refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    /// Set the refresh timeout.
    #[must_use]
    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Add a default header.
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.base_url.is_empty() {
            return Err(GatewayError::config("Base URL cannot be empty"));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| GatewayError::config(format!("Invalid base URL: {e}")))?;
        if !self.refresh_path.starts_with('/') {
            return Err(GatewayError::config("Refresh path must start with '/'"));
        }
        if self.refresh_timeout.is_zero() {
            return Err(GatewayError::config("Refresh timeout cannot be zero"));
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err(GatewayError::config("Request timeout cannot be zero"));
        }
        for (name, value) in &self.default_headers {
            HeaderName::try_from(name.as_str())
                .map_err(|e| GatewayError::config(format!("Invalid header name {name}: {e}")))?;
            HeaderValue::try_from(value.as_str())
                .map_err(|e| GatewayError::config(format!("Invalid header value for {name}: {e}")))?;
        }
        Ok(())
    }
}

/// Wraps every outbound call with anti-forgery headers, transparent
/// credential refresh and session routing.
#[derive(Clone)]
pub struct RequestGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    config: GatewayConfig,
    default_headers: Vec<(HeaderName, HeaderValue)>,
    executor: Arc<dyn HttpExecutor>,
    csrf: Arc<dyn CsrfTokenSource>,
    router: Arc<SessionRouter>,
    coordinator: RefreshCoordinator,
}

impl fmt::Debug for RequestGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGateway")
            .field("config", &self.inner.config)
            .field("coordinator", &self.inner.coordinator)
            .finish_non_exhaustive()
    }
}

impl RequestGateway {
    /// Create a gateway. One gateway owns one refresh coordinator for its
    /// whole lifetime; clone the gateway to share it.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn new(
        config: GatewayConfig,
        executor: Arc<dyn HttpExecutor>,
        csrf: Arc<dyn CsrfTokenSource>,
        router: SessionRouter,
    ) -> GatewayResult<Self> {
        config.validate()?;
        let mut default_headers = Vec::with_capacity(config.default_headers.len());
        for (name, value) in &config.default_headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| GatewayError::config(e.to_string()))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| GatewayError::config(e.to_string()))?;
            default_headers.push((name, value));
        }

        let router = Arc::new(router);
        let coordinator = RefreshCoordinator::new(Arc::clone(&router), config.refresh_timeout);
        Ok(Self {
            inner: Arc::new(GatewayInner {
                config,
                default_headers,
                executor,
                csrf,
                router,
                coordinator,
            }),
        })
    }

    /// Create a gateway speaking to `config.base_url` over [`HyperExecutor`].
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn with_hyper(
        config: GatewayConfig,
        csrf: Arc<dyn CsrfTokenSource>,
        router: SessionRouter,
    ) -> GatewayResult<Self> {
        let mut executor = HyperExecutor::new(&config.base_url)?;
        if let Some(timeout) = config.request_timeout {
            executor = executor.with_timeout(timeout);
        }
        Self::new(config, Arc::new(executor), csrf, router)
    }

    /// The gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// The refresh coordinator owned by this gateway.
    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.inner.coordinator
    }

    /// The session router used by this gateway.
    pub fn router(&self) -> &SessionRouter {
        &self.inner.router
    }

    /// Send a request.
    ///
    /// A 401 is recovered transparently by refreshing the credentials and
    /// replaying the request once.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Api`] for non-success responses, classified
    /// per [`ErrorClassification`], and [`GatewayError::Rejected`] when the
    /// session layer gave up on the request.
    pub async fn send(&self, mut request: ApiRequest) -> GatewayResult<ApiResponse> {
        if self.targets_refresh_endpoint(&request) {
            request.mark_refresh();
        }
        loop {
            self.prepare(&mut request);
            let response = self.inner.executor.execute(&request).await?;
            debug!(
                request_id = %request.id,
                method = %request.method,
                path = %request.path,
                status = response.status.as_u16(),
                retried = request.is_retried(),
                "Gateway response"
            );

            if response.is_success() {
                return Ok(response);
            }

            match response.status {
                StatusCode::UNAUTHORIZED => {
                    let refresh = self.execute_refresh();
                    self.inner
                        .coordinator
                        .recover(&mut request, &response, refresh)
                        .await?;
                    debug!(request_id = %request.id, "Replaying request after refresh");
                }
                StatusCode::FORBIDDEN => {
                    let classification = self.inner.router.route_forbidden(&response);
                    return Err(api_error(&response, classification));
                }
                StatusCode::INTERNAL_SERVER_ERROR => {
                    warn!(request_id = %request.id, path = %request.path, "Server error");
                    self.inner.router.report_server_error();
                    return Err(api_error(&response, ErrorClassification::ServerError));
                }
                _ => return Err(api_error(&response, ErrorClassification::Unclassified)),
            }
        }
    }

    /// A request aimed at the refresh path, however it was built. Its 401 is
    /// final and never answered with another refresh.
    fn targets_refresh_endpoint(&self, request: &ApiRequest) -> bool {
        let path = request.path.split_once('?').map_or(request.path.as_str(), |(p, _)| p);
        let refresh_path = self.inner.config.refresh_path.as_str();
        path.trim_end_matches('/') == refresh_path.trim_end_matches('/')
    }

    /// Send a request and decode the JSON response body.
    pub async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> GatewayResult<T> {
        self.send(request).await?.json()
    }

    /// GET `path` and decode the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> GatewayResult<T> {
        self.send_json(ApiRequest::get(path)).await
    }

    /// POST a JSON body to `path` and decode the JSON response.
    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> GatewayResult<T> {
        self.send_json(ApiRequest::post(path).json(body)?).await
    }

    /// PUT a JSON body to `path` and decode the JSON response.
    pub async fn put<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> GatewayResult<T> {
        self.send_json(ApiRequest::put(path).json(body)?).await
    }

    /// PATCH `path` with a JSON body and decode the JSON response.
    pub async fn patch<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> GatewayResult<T> {
        self.send_json(ApiRequest::patch(path).json(body)?).await
    }

    /// DELETE `path`, discarding the response body.
    pub async fn delete(&self, path: &str) -> GatewayResult<()> {
        self.send(ApiRequest::delete(path)).await.map(|_| ())
    }

    /// Renew the credentials explicitly, outside of any failing request.
    ///
    /// A 401 here is definitive: the session is cleared and the user is sent
    /// to login.
    pub async fn refresh_session(&self) -> GatewayResult<()> {
        self.send(ApiRequest::refresh(self.inner.config.refresh_path.clone()))
            .await
            .map(|_| ())
    }

    async fn execute_refresh(&self) -> GatewayResult<ApiResponse> {
        let mut request = ApiRequest::refresh(self.inner.config.refresh_path.clone());
        self.prepare(&mut request);
        self.inner.executor.execute(&request).await
    }

    /// Apply default headers and, for state-changing methods, the anti-forgery
    /// token. Runs before every attempt so a replay picks up a rotated token.
    fn prepare(&self, request: &mut ApiRequest) {
        for (name, value) in &self.inner.default_headers {
            if !request.headers.contains_key(name) {
                request.headers.insert(name.clone(), value.clone());
            }
        }

        if !request.is_state_changing() {
            return;
        }
        let csrf = HeaderName::from_static(CSRF_HEADER);
        match self.inner.csrf.csrf_token() {
            Some(token) => match HeaderValue::try_from(token) {
                Ok(value) => {
                    request.headers.insert(csrf, value);
                }
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed CSRF token");
                    request.headers.remove(csrf);
                }
            },
            None => {
                debug!(request_id = %request.id, "No CSRF token available");
                request.headers.remove(csrf);
            }
        }
    }
}

fn api_error(response: &ApiResponse, classification: ErrorClassification) -> GatewayError {
    GatewayError::api(response.status, classification, response.text())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::new("https://api.example.com");
        assert_eq!(config.refresh_path, "/auth/refresh");
        assert_eq!(config.refresh_timeout, Duration::from_secs(30));
        assert!(config.request_timeout.is_none());
        assert!(config.default_headers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(GatewayConfig::new("").validate().is_err());
        assert!(GatewayConfig::new("not a url").validate().is_err());
        assert!(
            GatewayConfig::new("https://api.example.com")
                .refresh_path("auth/refresh")
                .validate()
                .is_err()
        );
        assert!(
            GatewayConfig::new("https://api.example.com")
                .refresh_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            GatewayConfig::new("https://api.example.com")
                .request_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            GatewayConfig::new("https://api.example.com")
                .default_header("bad header", "x")
                .validate()
                .is_err()
        );
    }
}
