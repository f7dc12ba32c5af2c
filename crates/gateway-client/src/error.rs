//! Error types for the gateway and the push-stream consumer.

use std::time::Duration;

use http::StatusCode;
use thiserror::Error;

use crate::classify::ErrorClassification;

/// Result type returned by [`RequestGateway`](crate::gateway::RequestGateway) operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Result type returned by [`StreamConsumer`](crate::stream::StreamConsumer) operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors surfaced to callers of the request gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Connection-level failure from the HTTP client.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper_util::client::legacy::Error),

    /// Failure while reading a response body.
    #[error("HTTP body error: {0}")]
    Body(#[from] hyper::Error),

    /// The server answered with a non-success status.
    #[error("API error: status={status}, classification={classification}, body={body}")]
    Api {
        status: StatusCode,
        classification: ErrorClassification,
        body: String,
    },

    /// The request was rejected by the session layer without a response of
    /// its own, e.g. a queued request released by a failed refresh.
    #[error("Request rejected: {classification}")]
    Rejected {
        classification: ErrorClassification,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid URL in configuration or in a request path.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// Transport failures that do not originate in hyper (custom executors).
    #[error("Transport error: {message}")]
    Transport { message: String },
}

impl GatewayError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a rejection carrying only a classification.
    pub fn rejected(classification: ErrorClassification) -> Self {
        Self::Rejected { classification }
    }

    /// Create an API error.
    pub fn api(
        status: StatusCode,
        classification: ErrorClassification,
        body: impl Into<String>,
    ) -> Self {
        Self::Api {
            status,
            classification,
            body: body.into(),
        }
    }

    /// The session-level classification of this error.
    ///
    /// Errors that never reached the server are [`ErrorClassification::Unclassified`].
    pub fn classification(&self) -> ErrorClassification {
        match self {
            Self::Api { classification, .. } | Self::Rejected { classification } => {
                *classification
            }
            _ => ErrorClassification::Unclassified,
        }
    }

    /// HTTP status of the failed response, if there was one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Errors produced by the push-stream consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The push transport reported a failure.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The subscription driver has shut down.
    #[error("Subscription closed: {reason}")]
    SubscriptionClosed { reason: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl StreamError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub(crate) fn driver_gone() -> Self {
        Self::SubscriptionClosed {
            reason: "subscription driver shut down".to_string(),
        }
    }
}
