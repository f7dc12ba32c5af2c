//! Session routing: turns classified failures into session updates,
//! notifications and navigation.

use std::{fmt, sync::Arc};

use tracing::{info, warn};
use url::Url;

use crate::{
    classify::{self, ErrorClassification},
    error::{GatewayError, GatewayResult},
    session::{Navigation, Navigator, Notification, Notifier, PersistedState, SessionStore},
    transport::{ApiResponse, join_url},
};

/// Persisted key holding the path to restore after re-authentication.
pub const RETURN_TO_KEY: &str = "auth.return_to";
/// Persisted key holding the identity provider used for the last login.
pub const LAST_PROVIDER_KEY: &str = "auth.last_provider";
/// Query parameter carrying the restoration path.
pub const RETURN_TO_PARAM: &str = "return_to";

/// Routes and endpoints used by [`SessionRouter`].
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// API base URL hosting the OAuth authorize endpoints.
    pub api_base_url: String,
    /// Login route.
    pub login_path: String,
    /// Two-factor verification route.
    pub two_factor_path: String,
    /// Route used after a permission failure.
    pub default_path: String,
    /// Provider used when no previous login is recorded.
    pub default_oauth_provider: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            api_base_url: String::new(),
            login_path: "/login".to_string(),
            two_factor_path: "/verify-2fa".to_string(),
            default_path: "/".to_string(),
            default_oauth_provider: "google".to_string(),
        }
    }
}

impl RouterConfig {
    /// Create a router configuration for the given API base URL.
    #[must_use]
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Default::default()
        }
    }

    /// Set the login route.
    #[must_use]
    pub fn login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    /// Set the two-factor verification route.
    #[must_use]
    pub fn two_factor_path(mut self, path: impl Into<String>) -> Self {
        self.two_factor_path = path.into();
        self
    }

    /// Set the fallback route for permission failures.
    #[must_use]
    pub fn default_path(mut self, path: impl Into<String>) -> Self {
        self.default_path = path.into();
        self
    }

    /// Set the provider used when none was recorded.
    #[must_use]
    pub fn default_oauth_provider(mut self, provider: impl Into<String>) -> Self {
        self.default_oauth_provider = provider.into();
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error message string if any field has an invalid value.
    pub fn validate(&self) -> Result<(), String> {
        let api_base =
            Url::parse(&self.api_base_url).map_err(|e| format!("Invalid API base URL: {e}"))?;
        if api_base.cannot_be_a_base() {
            return Err("API base URL must be hierarchical".to_string());
        }
        for (name, path) in [
            ("Login", &self.login_path),
            ("Two-factor", &self.two_factor_path),
            ("Default", &self.default_path),
        ] {
            if !path.starts_with('/') {
                return Err(format!("{name} path must start with '/'"));
            }
        }
        if self.default_oauth_provider.is_empty() {
            return Err("Default OAuth provider cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Drives the side effects of session-level failures.
#[derive(Clone)]
pub struct SessionRouter {
    api_base: Url,
    config: Arc<RouterConfig>,
    session: Arc<dyn SessionStore>,
    navigator: Arc<dyn Navigator>,
    notifier: Arc<dyn Notifier>,
    state: Arc<dyn PersistedState>,
}

impl fmt::Debug for SessionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRouter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionRouter {
    /// Create a router.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration validation fails.
    pub fn new(
        config: RouterConfig,
        session: Arc<dyn SessionStore>,
        navigator: Arc<dyn Navigator>,
        notifier: Arc<dyn Notifier>,
        state: Arc<dyn PersistedState>,
    ) -> GatewayResult<Self> {
        config.validate().map_err(GatewayError::config)?;
        let api_base = Url::parse(&config.api_base_url)?;
        Ok(Self {
            api_base,
            config: Arc::new(config),
            session,
            navigator,
            notifier,
            state,
        })
    }

    /// Act on a 403 response and return its classification.
    ///
    /// Unrecognised 403s are left to the caller and cause no side effect.
    pub fn route_forbidden(&self, response: &ApiResponse) -> ErrorClassification {
        let classification = ErrorClassification::from_response(response);
        match classification {
            ErrorClassification::TwoFactorRequired => {
                info!("Two-factor verification required");
                self.session.mark_two_factor_pending();
                self.navigator
                    .navigate(Navigation::Route(self.config.two_factor_path.clone()));
            }
            ErrorClassification::PermissionDenied => {
                let detail = classify::detail(response);
                warn!(detail = ?detail, "Permission denied");
                self.notifier
                    .notify(Notification::permission_denied(detail.as_deref()));
                self.navigator
                    .navigate(Navigation::Route(self.config.default_path.clone()));
            }
            _ => {}
        }
        classification
    }

    /// Notify the user of a server error.
    pub fn report_server_error(&self) {
        self.notifier.notify(Notification::server_error());
    }

    /// Send the user back through the identity provider.
    ///
    /// The current path is persisted and also passed to the provider so the
    /// user lands where they left off.
    pub fn reauthorize_oauth(&self) {
        let return_to = self.navigator.current_path();
        self.state.set(RETURN_TO_KEY, &return_to);
        let provider = self
            .state
            .get(LAST_PROVIDER_KEY)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| self.config.default_oauth_provider.clone());

        let url = self.authorize_url(&provider, &return_to);
        warn!(provider = %provider, return_to = %return_to, "OAuth re-authorization required");
        self.navigator.navigate(Navigation::External(url.to_string()));
    }

    /// Clear the session and redirect to login, keeping the current path.
    pub fn expire_session(&self) {
        let return_to = self.navigator.current_path();
        warn!(return_to = %return_to, "Session expired; redirecting to login");
        self.session.clear();
        self.navigator
            .navigate(Navigation::Route(self.login_route(&return_to)));
    }

    /// Authorize endpoint for `provider` with the restoration path attached.
    ///
    /// `provider` is pushed as one percent-encoded path segment, so it can
    /// never address a different endpoint.
    pub fn authorize_url(&self, provider: &str, return_to: &str) -> Url {
        let mut url = join_url(&self.api_base, "/auth/oauth");
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(provider).push("authorize");
        }
        url.query_pairs_mut().append_pair(RETURN_TO_PARAM, return_to);
        url
    }

    fn login_route(&self, return_to: &str) -> String {
        if return_to.is_empty() || self.is_login_route(return_to) {
            return self.config.login_path.clone();
        }
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair(RETURN_TO_PARAM, return_to)
            .finish();
        format!("{}?{query}", self.config.login_path)
    }

    /// The login path itself, or the login path followed by a query or a
    /// sub-route. `/login-help` is not a login route.
    fn is_login_route(&self, path: &str) -> bool {
        let login = self.config.login_path.trim_end_matches('/');
        match path.strip_prefix(login) {
            Some(rest) => rest.is_empty() || rest.starts_with('?') || rest.starts_with('/'),
            None => false,
        }
    }
}
