//! Classification of failed responses into session-level categories.
//!
//! Classification is a pure function of `{status, headers, detail}`. The
//! body's `detail` field carries the machine-readable markers below.

use std::fmt;

use http::StatusCode;
use serde::Deserialize;

use crate::transport::ApiResponse;

/// Header naming the origin of the credential (`"oauth"` for provider-bound sessions).
pub const AUTH_METHOD_HEADER: &str = "x-auth-method";
/// Anti-forgery header attached to state-changing requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

pub const OAUTH_REAUTH_REQUIRED: &str = "oauth_reauthentication_required";
pub const TWO_FACTOR_REQUIRED: &str = "2fa_verification_required";
pub const MISSING_PERMISSIONS: &str = "Missing permissions";
pub const FORBIDDEN: &str = "Forbidden";
pub const INTERNAL_SERVER_ERROR: &str = "Internal Server Error";

/// Actionable category of a failure response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClassification {
    /// Credentials are missing or expired; a refresh may recover.
    Unauthenticated,
    /// The refresh call itself failed for a non-OAuth session.
    SessionExpired,
    /// The credential is provider-bound and must be re-authorized externally.
    OAuthReauthRequired,
    /// A second factor must be verified before continuing.
    TwoFactorRequired,
    /// The user lacks the permissions for this operation.
    PermissionDenied,
    ServerError,
    /// Anything else; passed through to the caller.
    Unclassified,
}

impl ErrorClassification {
    /// Classify a failed response received for an ordinary request.
    pub fn from_response(response: &ApiResponse) -> Self {
        let detail = detail(response);
        match response.status {
            StatusCode::UNAUTHORIZED => {
                if detail.as_deref() == Some(OAUTH_REAUTH_REQUIRED) {
                    Self::OAuthReauthRequired
                } else {
                    Self::Unauthenticated
                }
            }
            StatusCode::FORBIDDEN => match detail.as_deref() {
                Some(TWO_FACTOR_REQUIRED) => Self::TwoFactorRequired,
                Some(d) if d.contains(MISSING_PERMISSIONS) => Self::PermissionDenied,
                _ => Self::Unclassified,
            },
            StatusCode::INTERNAL_SERVER_ERROR => Self::ServerError,
            _ => Self::Unclassified,
        }
    }

    /// Classify the failure of the credential refresh call.
    ///
    /// Only two outcomes exist: the session is OAuth-bound and needs the
    /// provider, or it is gone.
    pub fn from_refresh_failure(response: &ApiResponse) -> Self {
        let oauth_header = response
            .header_str(AUTH_METHOD_HEADER)
            .is_some_and(|method| method.eq_ignore_ascii_case("oauth"));
        if oauth_header || detail(response).as_deref() == Some(OAUTH_REAUTH_REQUIRED) {
            Self::OAuthReauthRequired
        } else {
            Self::SessionExpired
        }
    }
}

impl fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unauthenticated => "Unauthenticated",
            Self::SessionExpired => "SessionExpired",
            Self::OAuthReauthRequired => "OAuthReauthRequired",
            Self::TwoFactorRequired => "TwoFactorRequired",
            Self::PermissionDenied => "PermissionDenied",
            Self::ServerError => "ServerError",
            Self::Unclassified => "Unclassified",
        };
        f.write_str(name)
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

/// Extract the `detail` marker from a JSON error body.
///
/// Non-string details (validation error lists) are not markers and yield `None`.
pub fn detail(response: &ApiResponse) -> Option<String> {
    let body: ErrorBody = serde_json::from_slice(&response.body).ok()?;
    match body.detail? {
        serde_json::Value::String(s) => Some(s),
        _ => None,
    }
}
