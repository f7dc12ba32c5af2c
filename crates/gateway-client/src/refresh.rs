//! Single-flight credential refresh.
//!
//! When several requests fail with 401 at once, exactly one of them performs
//! the refresh call. The others park in a queue of pending requests and are released
//! together when it settles: resolved on success so their callers replay,
//! rejected with one shared classification on failure.
//!
//! The `is_refreshing` check and the enqueue (or the flag set) happen inside
//! one critical section with no suspension point, so two concurrent 401s can
//! never both start a refresh.

use std::{
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::{
    classify::ErrorClassification,
    error::{GatewayError, GatewayResult},
    router::SessionRouter,
    transport::{ApiRequest, ApiResponse, RequestId},
};

type Settlement = Result<(), ErrorClassification>;

/// A request parked while another request refreshes the credentials.
pub(crate) struct PendingRequest {
    /// The parked request.
    request_id: RequestId,
    /// When it was parked.
    queued_at: Instant,
    settle_tx: oneshot::Sender<Settlement>,
}

impl PendingRequest {
    fn new(request_id: RequestId) -> (Self, oneshot::Receiver<Settlement>) {
        let (settle_tx, settle_rx) = oneshot::channel();
        let pending = Self {
            request_id,
            queued_at: Instant::now(),
            settle_tx,
        };
        (pending, settle_rx)
    }

    fn settle(self, outcome: Settlement) {
        debug!(
            request_id = %self.request_id,
            waited_ms = self.queued_at.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "Releasing queued request"
        );
        // The caller may have given up; nothing to do then.
        let _ = self.settle_tx.send(outcome);
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request_id", &self.request_id)
            .field("queued_at", &self.queued_at)
            .finish()
    }
}

/// Refresh bookkeeping. `queue` is non-empty only while `is_refreshing`.
#[derive(Debug, Default)]
pub(crate) struct RefreshState {
    is_refreshing: bool,
    queue: Vec<PendingRequest>,
}

/// Serializes credential renewal across concurrently failing requests.
pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    router: Arc<SessionRouter>,
    refresh_timeout: Duration,
}

impl fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RefreshCoordinator")
            .field("is_refreshing", &state.is_refreshing)
            .field("queued", &state.queue.len())
            .field("refresh_timeout", &self.refresh_timeout)
            .finish()
    }
}

enum Role {
    Leader,
    Follower(oneshot::Receiver<Settlement>),
}

impl RefreshCoordinator {
    /// Create a coordinator whose refresh calls are bounded by `refresh_timeout`.
    pub fn new(router: Arc<SessionRouter>, refresh_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(RefreshState::default()),
            router,
            refresh_timeout,
        }
    }

    /// Returns `true` while a refresh call is in flight.
    pub fn is_refreshing(&self) -> bool {
        self.state.lock().is_refreshing
    }

    /// Number of requests parked behind the in-flight refresh.
    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Recover from a 401 received for `request`.
    ///
    /// Returns `Ok(())` when the credentials were renewed and the caller
    /// should replay `request`. `refresh` performs the refresh call; it is
    /// only polled if this request ends up leading the refresh.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Rejected`] carrying:
    /// - `Unauthenticated` if `request` is the refresh call or was already
    ///   replayed once (the session is cleared),
    /// - `OAuthReauthRequired` if the credential must be renewed with the
    ///   identity provider,
    /// - `SessionExpired` if the refresh failed or timed out.
    pub async fn recover<F>(
        &self,
        request: &mut ApiRequest,
        response: &ApiResponse,
        refresh: F,
    ) -> GatewayResult<()>
    where
        F: Future<Output = GatewayResult<ApiResponse>>,
    {
        if request.is_refresh() || request.is_retried() {
            error!(
                request_id = %request.id,
                path = %request.path,
                refresh_call = request.is_refresh(),
                "Authentication failed after refresh"
            );
            self.router.expire_session();
            return Err(GatewayError::rejected(ErrorClassification::Unauthenticated));
        }

        if ErrorClassification::from_response(response) == ErrorClassification::OAuthReauthRequired
        {
            self.router.reauthorize_oauth();
            return Err(GatewayError::rejected(
                ErrorClassification::OAuthReauthRequired,
            ));
        }

        request.mark_retried();

        let role = {
            let mut state = self.state.lock();
            if state.is_refreshing {
                let (pending, settle_rx) = PendingRequest::new(request.id.clone());
                state.queue.push(pending);
                Role::Follower(settle_rx)
            } else {
                state.is_refreshing = true;
                Role::Leader
            }
        };

        match role {
            Role::Follower(settle_rx) => {
                debug!(request_id = %request.id, "Refresh in flight; request queued");
                match settle_rx.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(classification)) => Err(GatewayError::rejected(classification)),
                    Err(_) => Err(GatewayError::rejected(ErrorClassification::SessionExpired)),
                }
            }
            Role::Leader => self.lead_refresh(request, refresh).await,
        }
    }

    async fn lead_refresh<F>(&self, request: &ApiRequest, refresh: F) -> GatewayResult<()>
    where
        F: Future<Output = GatewayResult<ApiResponse>>,
    {
        info!(request_id = %request.id, "Refreshing credentials");
        let guard = SettleGuard {
            coordinator: self,
            settled: false,
        };

        let outcome = match tokio::time::timeout(self.refresh_timeout, refresh).await {
            Ok(Ok(response)) if response.is_success() => Ok(()),
            Ok(Ok(response)) => {
                let classification = ErrorClassification::from_refresh_failure(&response);
                warn!(
                    status = response.status.as_u16(),
                    classification = %classification,
                    "Credential refresh rejected"
                );
                Err(classification)
            }
            Ok(Err(err)) => {
                warn!(error = %err, "Credential refresh failed");
                Err(ErrorClassification::SessionExpired)
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.refresh_timeout.as_millis() as u64,
                    "Credential refresh timed out"
                );
                Err(ErrorClassification::SessionExpired)
            }
        };

        guard.settle(outcome);

        match outcome {
            Ok(()) => {
                info!(request_id = %request.id, "Credentials refreshed");
                Ok(())
            }
            Err(ErrorClassification::OAuthReauthRequired) => {
                self.router.reauthorize_oauth();
                Err(GatewayError::rejected(
                    ErrorClassification::OAuthReauthRequired,
                ))
            }
            Err(classification) => {
                self.router.expire_session();
                Err(GatewayError::rejected(classification))
            }
        }
    }

    /// Release every queued request and clear the flag in one step.
    fn release(&self, outcome: Settlement) {
        let queue = {
            let mut state = self.state.lock();
            state.is_refreshing = false;
            std::mem::take(&mut state.queue)
        };
        debug!(released = queue.len(), ok = outcome.is_ok(), "Refresh settled");
        for pending in queue {
            pending.settle(outcome);
        }
    }
}

/// Clears `is_refreshing` on every exit path of the leader, including the
/// leader's future being dropped mid-refresh.
struct SettleGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl SettleGuard<'_> {
    fn settle(mut self, outcome: Settlement) {
        self.settled = true;
        self.coordinator.release(outcome);
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Refresh abandoned; failing queued requests");
            self.coordinator
                .release(Err(ErrorClassification::SessionExpired));
        }
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;

    use super::*;
    use crate::{
        router::RouterConfig,
        session::{MemoryNavigator, MemorySessionStore, MemoryState, Navigation, TracingNotifier},
    };

    fn coordinator(timeout: Duration) -> (RefreshCoordinator, Arc<MemoryNavigator>) {
        let navigator = Arc::new(MemoryNavigator::new("/tasks"));
        let router = SessionRouter::new(
            RouterConfig::new("https://api.example.com"),
            Arc::new(MemorySessionStore::authenticated()),
            navigator.clone(),
            Arc::new(TracingNotifier::new()),
            Arc::new(MemoryState::new()),
        )
        .expect("router");
        (RefreshCoordinator::new(Arc::new(router), timeout), navigator)
    }

    fn unauthorized() -> ApiResponse {
        ApiResponse::new(StatusCode::UNAUTHORIZED, r#"{"detail":"Not authenticated"}"#)
    }

    async fn ok_refresh() -> GatewayResult<ApiResponse> {
        Ok(ApiResponse::new(StatusCode::OK, ""))
    }

    // Polling this would surface as SessionExpired rather than the expected class.
    async fn failing_refresh() -> GatewayResult<ApiResponse> {
        Err(GatewayError::transport("refresh must not run"))
    }

    #[tokio::test]
    async fn test_leader_success_marks_retried() {
        let (coordinator, navigator) = coordinator(Duration::from_secs(5));
        let mut request = ApiRequest::get("/tasks");

        coordinator
            .recover(&mut request, &unauthorized(), ok_refresh())
            .await
            .expect("recovered");

        assert!(request.is_retried());
        assert!(!coordinator.is_refreshing());
        assert!(navigator.history().is_empty());
    }

    #[tokio::test]
    async fn test_retried_request_is_definitive() {
        let (coordinator, navigator) = coordinator(Duration::from_secs(5));
        let mut request = ApiRequest::get("/tasks");
        request.mark_retried();

        let err = coordinator
            .recover(&mut request, &unauthorized(), failing_refresh())
            .await
            .expect_err("definitive");

        assert_eq!(err.classification(), ErrorClassification::Unauthenticated);
        assert_eq!(
            navigator.last(),
            Some(Navigation::Route("/login?return_to=%2Ftasks".to_string()))
        );
    }

    #[tokio::test]
    async fn test_refresh_call_401_is_definitive() {
        let (coordinator, _navigator) = coordinator(Duration::from_secs(5));
        let mut request = ApiRequest::refresh("/auth/refresh");

        let err = coordinator
            .recover(&mut request, &unauthorized(), ok_refresh())
            .await
            .expect_err("definitive");
        assert_eq!(err.classification(), ErrorClassification::Unauthenticated);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_direct_oauth_401_skips_refresh() {
        let (coordinator, navigator) = coordinator(Duration::from_secs(5));
        let mut request = ApiRequest::get("/tasks");
        let response = ApiResponse::new(
            StatusCode::UNAUTHORIZED,
            r#"{"detail":"oauth_reauthentication_required"}"#,
        );

        let err = coordinator
            .recover(&mut request, &response, failing_refresh())
            .await
            .expect_err("oauth");

        assert_eq!(err.classification(), ErrorClassification::OAuthReauthRequired);
        assert!(matches!(navigator.last(), Some(Navigation::External(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_releases_flag() {
        let (coordinator, _navigator) = coordinator(Duration::from_secs(3));
        let mut request = ApiRequest::get("/tasks");

        let err = coordinator
            .recover(
                &mut request,
                &unauthorized(),
                std::future::pending::<GatewayResult<ApiResponse>>(),
            )
            .await
            .expect_err("timeout");

        assert_eq!(err.classification(), ErrorClassification::SessionExpired);
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_dropped_leader_fails_followers() {
        let (coordinator, _navigator) = coordinator(Duration::from_secs(30));
        let coordinator = Arc::new(coordinator);
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let mut request = ApiRequest::get("/a");
                coordinator
                    .recover(&mut request, &unauthorized(), async move {
                        let _ = gate_rx.await;
                        ok_refresh().await
                    })
                    .await
            })
        };
        while !coordinator.is_refreshing() {
            tokio::task::yield_now().await;
        }

        let follower = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                let mut request = ApiRequest::get("/b");
                coordinator
                    .recover(&mut request, &unauthorized(), ok_refresh())
                    .await
            })
        };
        while coordinator.queued() == 0 {
            tokio::task::yield_now().await;
        }

        leader.abort();
        let _ = leader.await;
        drop(gate_tx);

        let err = follower
            .await
            .expect("join")
            .expect_err("released with failure");
        assert_eq!(err.classification(), ErrorClassification::SessionExpired);
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.queued(), 0);
    }
}
