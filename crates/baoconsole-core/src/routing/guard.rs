//! Route access gating on session validity.
//!
//! Protected routes require `SessionStore::is_authenticated` (token present
//! and outside the expiry buffer). An unauthenticated visit is redirected to
//! login carrying the requested path in `redirect_to`; an authenticated visit
//! to login goes to `redirect_to` or the landing route.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use super::navigator::{strip_query, Location, Navigator};
use crate::session::{SessionStore, SubscriptionId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    pub login: String,
    /// Where a fresh login lands without a `redirect_to`.
    pub landing: String,
    pub unseal: String,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            login: "/login".to_string(),
            landing: "/dashboard".to_string(),
            unseal: "/unseal".to_string(),
        }
    }
}

impl RouteTable {
    /// Login and unseal (and anything below them) need no session.
    pub fn is_public(&self, path: &str) -> bool {
        let path = strip_query(path);
        [&self.login, &self.unseal].iter().any(|public| {
            path == public.as_str()
                || path
                    .strip_prefix(public.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    pub fn is_login(&self, path: &str) -> bool {
        strip_query(path) == self.login
    }

    pub fn is_unseal(&self, path: &str) -> bool {
        strip_query(path) == self.unseal
    }
}

/// Only in-app absolute paths are followed after login.
pub fn is_safe_redirect(target: &str) -> bool {
    target.starts_with('/') && !target.starts_with("//") && !target.contains("://") && !target.contains('\\')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    Redirect(Location),
}

struct GuardInner {
    store: SessionStore,
    navigator: Arc<dyn Navigator>,
    routes: RouteTable,
    subscription: Mutex<Option<SubscriptionId>>,
}

#[derive(Clone)]
pub struct RouteGuard {
    inner: Arc<GuardInner>,
}

impl RouteGuard {
    pub fn new(store: SessionStore, navigator: Arc<dyn Navigator>, routes: RouteTable) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                store,
                navigator,
                routes,
                subscription: Mutex::new(None),
            }),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }

    pub fn navigator(&self) -> &Arc<dyn Navigator> {
        &self.inner.navigator
    }

    /// Decide whether `location` may render now.
    pub fn check(&self, location: &Location) -> GuardDecision {
        let routes = &self.inner.routes;
        let path = strip_query(&location.path);
        let authenticated = self.inner.store.is_authenticated();

        if path.is_empty() || path == "/" {
            let target = if authenticated { &routes.landing } else { &routes.login };
            return GuardDecision::Redirect(Location::new(target.clone()));
        }

        if routes.is_login(path) {
            if !authenticated {
                return GuardDecision::Allow;
            }
            return GuardDecision::Redirect(Location::new(self.post_login_target(location.redirect_to.as_deref())));
        }

        if routes.is_public(path) || authenticated {
            return GuardDecision::Allow;
        }

        GuardDecision::Redirect(Location::with_redirect(routes.login.clone(), path))
    }

    pub fn can_render(&self, path: &str) -> bool {
        self.check(&Location::parse(path)) == GuardDecision::Allow
    }

    /// Navigate to `location`, or wherever the guard sends it instead.
    /// Returns where the navigator ended up.
    pub fn navigate(&self, location: &Location) -> Location {
        let target = match self.check(location) {
            GuardDecision::Allow => location.clone(),
            GuardDecision::Redirect(redirect) => {
                debug!(from = %location, to = %redirect, "Route guard redirect");
                redirect
            }
        };
        self.inner.navigator.navigate(&target);
        target
    }

    /// After a successful login: follow `redirect_to` (or the one on the
    /// current location) when it is safe, else land on the default route.
    pub fn complete_login(&self, redirect_to: Option<&str>) -> Location {
        let pending = self.inner.navigator.current().redirect_to;
        let target = Location::new(self.post_login_target(redirect_to.or(pending.as_deref())));
        self.inner.navigator.navigate(&target);
        target
    }

    /// Send the console to login, remembering `from` when it is protected.
    pub fn redirect_to_login(&self, from: &str) -> Location {
        let routes = &self.inner.routes;
        let from = strip_query(from);
        let target = if routes.is_public(from) || from.is_empty() || from == "/" {
            Location::new(routes.login.clone())
        } else {
            Location::with_redirect(routes.login.clone(), from)
        };
        self.inner.navigator.navigate(&target);
        target
    }

    fn post_login_target(&self, redirect_to: Option<&str>) -> String {
        let routes = &self.inner.routes;
        match redirect_to {
            Some(target) if is_safe_redirect(target) && !routes.is_login(target) => target.to_string(),
            Some(target) => {
                debug!(target, "Ignoring unsafe redirect target");
                routes.landing.clone()
            }
            None => routes.landing.clone(),
        }
    }

    // ===== Reactive redirect =====

    /// Watch the session and leave protected routes as soon as it stops
    /// being valid. Idempotent.
    pub fn attach(&self) {
        let mut subscription = self.inner.subscription.lock();
        if subscription.is_some() {
            return;
        }
        let weak: Weak<GuardInner> = Arc::downgrade(&self.inner);
        let id = self.inner.store.subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                RouteGuard { inner }.enforce_current();
            }
        });
        *subscription = Some(id);
    }

    pub fn detach(&self) {
        if let Some(id) = self.inner.subscription.lock().take() {
            self.inner.store.unsubscribe(id);
        }
    }

    fn enforce_current(&self) {
        let current = self.inner.navigator.current();
        if self.inner.routes.is_public(&current.path) || self.inner.store.is_authenticated() {
            return;
        }
        if current.path == "/" {
            return;
        }
        info!(path = %current.path, "Session no longer valid, redirecting to login");
        self.redirect_to_login(&current.path);
    }
}

impl Drop for GuardInner {
    fn drop(&mut self) {
        if let Some(id) = self.subscription.get_mut().take() {
            self.store.unsubscribe(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::HistoryNavigator;
    use crate::session::{NamespacePolicy, TokenMeta};

    fn guard_at(start: &str) -> (SessionStore, Arc<HistoryNavigator>, RouteGuard) {
        let store = SessionStore::new();
        let navigator = Arc::new(HistoryNavigator::new(start));
        let guard = RouteGuard::new(store.clone(), navigator.clone(), RouteTable::default());
        (store, navigator, guard)
    }

    fn login(store: &SessionStore) {
        store.set_authenticated("t1".to_string(), TokenMeta::new("acc", 3600, true, vec![]), None);
    }

    #[test]
    fn test_protected_route_redirects_with_path() {
        let (store, navigator, guard) = guard_at("/");
        let decision = guard.check(&Location::parse("/secrets?tab=kv"));
        assert_eq!(
            decision,
            GuardDecision::Redirect(Location::with_redirect("/login", "/secrets"))
        );
        assert!(!guard.can_render("/secrets"));

        guard.navigate(&Location::new("/secrets"));
        assert_eq!(navigator.current().redirect_to.as_deref(), Some("/secrets"));

        login(&store);
        let landed = guard.complete_login(None);
        assert_eq!(landed.path, "/secrets");
        assert_eq!(navigator.current_path(), "/secrets");
    }

    #[test]
    fn test_login_route_when_authenticated() {
        let (store, _, guard) = guard_at("/");
        login(&store);
        assert_eq!(
            guard.check(&Location::new("/login")),
            GuardDecision::Redirect(Location::new("/dashboard"))
        );
        assert_eq!(
            guard.check(&Location::with_redirect("/login", "/policies")),
            GuardDecision::Redirect(Location::new("/policies"))
        );
        assert_eq!(
            guard.check(&Location::with_redirect("/login", "//evil.example")),
            GuardDecision::Redirect(Location::new("/dashboard"))
        );
    }

    #[test]
    fn test_root_route() {
        let (store, _, guard) = guard_at("/");
        assert_eq!(guard.check(&Location::new("/")), GuardDecision::Redirect(Location::new("/login")));
        login(&store);
        assert_eq!(
            guard.check(&Location::new("/")),
            GuardDecision::Redirect(Location::new("/dashboard"))
        );
    }

    #[test]
    fn test_public_routes() {
        let (_, _, guard) = guard_at("/");
        assert!(guard.can_render("/unseal"));
        assert!(guard.can_render("/login"));
        assert!(!guard.can_render("/unsealed"));
    }

    #[test]
    fn test_expiring_token_is_not_enough() {
        let (store, _, guard) = guard_at("/");
        let mut meta = TokenMeta::new("acc", 3600, true, vec![]);
        meta.expires_at = chrono::Utc::now() + chrono::Duration::minutes(4);
        store.set_authenticated("t1".to_string(), meta, None);
        assert!(!guard.can_render("/secrets"));
    }

    #[test]
    fn test_reactive_redirect_on_logout() {
        let (store, navigator, guard) = guard_at("/policies");
        login(&store);
        guard.attach();
        guard.attach();

        store.clear(NamespacePolicy::Preserve);
        assert_eq!(navigator.current(), Location::with_redirect("/login", "/policies"));
        assert_eq!(navigator.visited().len(), 1);

        guard.detach();
        navigator.navigate(&Location::new("/secrets"));
        store.clear(NamespacePolicy::Preserve);
        assert_eq!(navigator.current_path(), "/secrets");
    }

    #[test]
    fn test_safe_redirects() {
        assert!(is_safe_redirect("/secrets/kv"));
        assert!(!is_safe_redirect("https://evil.example"));
        assert!(!is_safe_redirect("//evil.example"));
        assert!(!is_safe_redirect("secrets"));
    }
}
