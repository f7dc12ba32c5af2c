//! Interfaces to the collaborators the gateway drives but does not own.
//!
//! The session store's persistence, the router and the notification UI live
//! outside this crate. They are reached only through these traits. In-memory
//! implementations are provided for headless use and tests.

use std::{collections::HashMap, fmt};

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

/// Global session state as seen by the gateway.
pub trait SessionStore: Send + Sync {
    /// Forget the current user and credentials.
    fn clear(&self);

    /// Record that the session is waiting for two-factor verification.
    fn mark_two_factor_pending(&self);
}

/// Navigation target chosen by the session router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    /// An in-app route, path plus optional query.
    Route(String),
    /// An external URL (identity provider).
    External(String),
}

impl fmt::Display for Navigation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Route(path) => write!(f, "route:{path}"),
            Self::External(url) => write!(f, "external:{url}"),
        }
    }
}

/// Application router.
pub trait Navigator: Send + Sync {
    /// The path the user is currently on.
    fn current_path(&self) -> String;

    fn navigate(&self, target: Navigation);
}

/// Kind of user-visible notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ServerError,
    PermissionDenied,
}

/// A user-visible notification (toast).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
}

impl Notification {
    pub fn server_error() -> Self {
        Self {
            kind: NotificationKind::ServerError,
            message: "The server encountered an error. Please try again later.".to_string(),
        }
    }

    pub fn permission_denied(detail: Option<&str>) -> Self {
        Self {
            kind: NotificationKind::PermissionDenied,
            message: detail
                .unwrap_or("You do not have permission to perform this action.")
                .to_string(),
        }
    }
}

/// Sink for user-visible notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Small persisted key/value state that survives redirects.
pub trait PersistedState: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str);
}

/// Source of the anti-forgery token.
pub trait CsrfTokenSource: Send + Sync {
    /// Current token, or `None` when none has been issued yet.
    fn csrf_token(&self) -> Option<String>;
}

/// [`SessionStore`] kept in memory.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: RwLock<SessionFlags>,
}

/// Snapshot of [`MemorySessionStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub authenticated: bool,
    pub two_factor_pending: bool,
}

impl MemorySessionStore {
    /// A store holding an authenticated session.
    pub fn authenticated() -> Self {
        Self {
            inner: RwLock::new(SessionFlags {
                authenticated: true,
                two_factor_pending: false,
            }),
        }
    }

    pub fn flags(&self) -> SessionFlags {
        *self.inner.read()
    }
}

impl SessionStore for MemorySessionStore {
    fn clear(&self) {
        *self.inner.write() = SessionFlags::default();
    }

    fn mark_two_factor_pending(&self) {
        self.inner.write().two_factor_pending = true;
    }
}

/// [`PersistedState`] kept in a map.
#[derive(Debug, Default)]
pub struct MemoryState {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistedState for MemoryState {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.write().insert(key.to_string(), value.to_string());
    }
}

/// [`Navigator`] that tracks the current path and records every navigation.
#[derive(Debug)]
pub struct MemoryNavigator {
    current: RwLock<String>,
    history: Mutex<Vec<Navigation>>,
}

impl MemoryNavigator {
    pub fn new(current_path: impl Into<String>) -> Self {
        Self {
            current: RwLock::new(current_path.into()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Every navigation issued so far, oldest first.
    pub fn history(&self) -> Vec<Navigation> {
        self.history.lock().clone()
    }

    pub fn last(&self) -> Option<Navigation> {
        self.history.lock().last().cloned()
    }
}

impl Navigator for MemoryNavigator {
    fn current_path(&self) -> String {
        self.current.read().clone()
    }

    fn navigate(&self, target: Navigation) {
        info!(target = %target, "Navigating");
        if let Navigation::Route(path) = &target {
            *self.current.write() = path.clone();
        }
        self.history.lock().push(target);
    }
}

/// [`Notifier`] that logs and records notifications.
#[derive(Debug, Default)]
pub struct TracingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl TracingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        warn!(kind = ?notification.kind, message = %notification.message, "User notification");
        self.sent.lock().push(notification);
    }
}

/// [`CsrfTokenSource`] holding a replaceable token.
#[derive(Debug, Default)]
pub struct StaticCsrfToken {
    token: RwLock<Option<String>>,
}

impl StaticCsrfToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    /// A source that has no token.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

impl CsrfTokenSource for StaticCsrfToken {
    fn csrf_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_session_store() {
        let store = MemorySessionStore::authenticated();
        assert!(store.flags().authenticated);

        store.mark_two_factor_pending();
        assert!(store.flags().two_factor_pending);

        store.clear();
        assert_eq!(store.flags(), SessionFlags::default());
    }

    #[test]
    fn test_memory_navigator_tracks_routes() {
        let navigator = MemoryNavigator::new("/projects");
        navigator.navigate(Navigation::Route("/login".to_string()));
        navigator.navigate(Navigation::External("https://idp.example.com".to_string()));

        assert_eq!(navigator.current_path(), "/login");
        assert_eq!(navigator.history().len(), 2);
        assert_eq!(
            navigator.last(),
            Some(Navigation::External("https://idp.example.com".to_string()))
        );
    }

    #[test]
    fn test_static_csrf_token() {
        let source = StaticCsrfToken::empty();
        assert_eq!(source.csrf_token(), None);
        source.set(Some("abc".to_string()));
        assert_eq!(source.csrf_token().as_deref(), Some("abc"));
    }
}
