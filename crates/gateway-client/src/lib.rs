//! # gateway-client
//!
//! Client-side resilience layer for authenticated API traffic.
//!
//! - [`RequestGateway`] wraps every outbound call. It attaches the
//!   anti-forgery token to state-changing requests and recovers a 401 by
//!   refreshing the session once and replaying the request.
//! - [`RefreshCoordinator`] guarantees at most one refresh call in flight;
//!   concurrent 401s queue behind it and settle together.
//! - [`SessionRouter`] turns definitive auth failures, 403s and 500s into
//!   session updates, notifications and navigation.
//! - [`stream`] consumes a push stream of agent progress messages with
//!   bounded automatic reconnection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use gateway_client::{
//!     GatewayConfig, RequestGateway, RouterConfig, SessionRouter,
//!     session::{MemoryNavigator, MemorySessionStore, MemoryState, StaticCsrfToken, TracingNotifier},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let router = SessionRouter::new(
//!         RouterConfig::new("http://localhost:8000/api"),
//!         Arc::new(MemorySessionStore::authenticated()),
//!         Arc::new(MemoryNavigator::new("/")),
//!         Arc::new(TracingNotifier::new()),
//!         Arc::new(MemoryState::new()),
//!     )?;
//!     let gateway = RequestGateway::with_hyper(
//!         GatewayConfig::new("http://localhost:8000/api"),
//!         Arc::new(StaticCsrfToken::new("token")),
//!         router,
//!     )?;
//!
//!     let profile: serde_json::Value = gateway.get("/users/me").await?;
//!     println!("{profile}");
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod error;
pub mod gateway;
pub mod refresh;
pub mod router;
pub mod session;
pub mod stream;
pub mod transport;

pub use classify::ErrorClassification;
pub use error::{GatewayError, GatewayResult, StreamError, StreamResult};
pub use gateway::{GatewayConfig, RequestGateway};
pub use refresh::RefreshCoordinator;
pub use router::{RouterConfig, SessionRouter};
pub use session::{
    CsrfTokenSource, Navigation, Navigator, Notification, NotificationKind, Notifier,
    PersistedState, SessionStore,
};
pub use stream::{StreamConfig, StreamConsumer, StreamObserver, StreamStatus};
pub use transport::{ApiRequest, ApiResponse, HttpExecutor, HyperExecutor, RequestId, RequestKind};
