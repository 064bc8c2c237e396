//! The assembled console.
//!
//! `Console` owns one instance of every component and wires them together:
//! the store feeds the guard and the persisted session file, the switcher
//! fences the query cache, and API failures that mean "your token is gone"
//! are routed back through the manager and the guard.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::api::{ApiClient, ApiError, ClientFactory, HttpTransport, SealStatus, Transport};
use crate::auth::{
    discover_methods, format_method_value, AuthError, LoginOption, PendingAuthRequest, SessionFile,
    TokenManager,
};
use crate::cache::QueryCache;
use crate::config::{ConsoleConfig, PreferenceStore};
use crate::health::{PollerHandle, SealPoller};
use crate::namespace::{self, Namespace, NamespaceSwitcher};
use crate::notify::{Notification, NotificationLevel, Notifier, TracingNotifier};
use crate::routing::{HistoryNavigator, Location, Navigator, RouteGuard};
use crate::session::{Session, SessionStore, SubscriptionId};

const NAMESPACES_KEY: &str = "namespaces";
const AUTH_METHODS_KEY: &str = "auth-methods";

pub struct ConsoleBuilder {
    config: ConsoleConfig,
    transport: Option<Arc<dyn Transport>>,
    navigator: Option<Arc<dyn Navigator>>,
    notifier: Option<Arc<dyn Notifier>>,
    prefs: Option<PreferenceStore>,
    session_file: Option<SessionFile>,
}

impl ConsoleBuilder {
    pub fn new(config: ConsoleConfig) -> Self {
        Self {
            config,
            transport: None,
            navigator: None,
            notifier: None,
            prefs: None,
            session_file: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = Some(navigator);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn preferences(mut self, prefs: PreferenceStore) -> Self {
        self.prefs = Some(prefs);
        self
    }

    /// Persist the session across restarts in `file`.
    pub fn session_file(mut self, file: SessionFile) -> Self {
        self.session_file = Some(file);
        self
    }

    /// Defaults: HTTP transport, in-memory navigator starting at `/`,
    /// log notifier, in-memory preferences, no session persistence.
    pub fn build(self) -> Result<Console> {
        let config = self.config;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.request_timeout)?),
        };
        let navigator = self
            .navigator
            .unwrap_or_else(|| Arc::new(HistoryNavigator::default()));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));
        let prefs = self.prefs.unwrap_or_else(PreferenceStore::in_memory);

        let store = SessionStore::with_expiry_buffer(config.expiry_buffer);
        let factory = ClientFactory::new(config.base_url.clone(), transport);
        let cache = QueryCache::new(config.stale_time);
        let manager = TokenManager::new(store.clone(), factory.clone());
        let switcher = NamespaceSwitcher::new(store.clone(), cache.clone(), prefs.clone());
        let guard = RouteGuard::new(store.clone(), Arc::clone(&navigator), config.routes.clone());
        let poller = SealPoller::new(
            factory.clone(),
            navigator,
            Arc::clone(&notifier),
            config.routes.unseal.clone(),
        )
        .with_interval(config.poll_interval);

        Ok(Console {
            config,
            store,
            factory,
            cache,
            prefs,
            manager,
            switcher,
            guard,
            poller,
            notifier,
            session_file: self.session_file.map(Arc::new),
            persistence: Mutex::new(None),
            poller_handle: Mutex::new(None),
        })
    }
}

pub struct Console {
    config: ConsoleConfig,
    store: SessionStore,
    factory: ClientFactory,
    cache: QueryCache,
    prefs: PreferenceStore,
    manager: TokenManager,
    switcher: NamespaceSwitcher,
    guard: RouteGuard,
    poller: SealPoller,
    notifier: Arc<dyn Notifier>,
    session_file: Option<Arc<SessionFile>>,
    persistence: Mutex<Option<SubscriptionId>>,
    poller_handle: Mutex<Option<PollerHandle>>,
}

impl Console {
    pub fn builder(config: ConsoleConfig) -> ConsoleBuilder {
        ConsoleBuilder::new(config)
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn manager(&self) -> &TokenManager {
        &self.manager
    }

    pub fn switcher(&self) -> &NamespaceSwitcher {
        &self.switcher
    }

    pub fn guard(&self) -> &RouteGuard {
        &self.guard
    }

    pub fn poller(&self) -> &SealPoller {
        &self.poller
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.prefs
    }

    pub fn session(&self) -> Session {
        self.store.snapshot()
    }

    // ===== Lifecycle =====

    /// Rehydrate the persisted session and namespace, then start watching
    /// the session. Returns whether a usable session was restored.
    pub async fn bootstrap(&self) -> bool {
        if let Some(file) = &self.session_file {
            match file.load() {
                Ok(Some(session)) => {
                    self.manager.resume(session).await;
                }
                Ok(None) => debug!("No persisted session"),
                Err(e) => error!(error = %e, "Failed to load persisted session"),
            }
        }
        self.switcher.restore();
        self.attach_persistence();
        self.guard.attach();

        let authenticated = self.store.is_authenticated();
        info!(authenticated, namespace = ?self.store.namespace(), "Console ready");
        authenticated
    }

    fn attach_persistence(&self) {
        let Some(file) = self.session_file.clone() else {
            return;
        };
        let mut persistence = self.persistence.lock();
        if persistence.is_some() {
            return;
        }
        let id = self.store.subscribe(move |session| {
            if let Err(e) = file.save(session) {
                error!(error = %e, "Failed to persist session");
            }
        });
        *persistence = Some(id);
    }

    /// Start the seal poller. A second call keeps the running one.
    pub fn start_background(&self) {
        let mut handle = self.poller_handle.lock();
        if handle.as_ref().is_some_and(PollerHandle::is_running) {
            return;
        }
        *handle = Some(self.poller.start());
    }

    /// Stop background work and detach observers. The session is untouched.
    pub fn teardown(&self) {
        if let Some(handle) = self.poller_handle.lock().take() {
            handle.stop();
        }
        self.manager.shutdown();
        self.guard.detach();
        if let Some(id) = self.persistence.lock().take() {
            self.store.unsubscribe(id);
        }
        debug!("Console torn down");
    }

    // ===== Authentication =====

    pub async fn login(&self, request: PendingAuthRequest) -> Result<Session, AuthError> {
        let method_value = format_method_value(request.method.as_str(), &format!("{}/", request.mount()));
        let session = self.manager.login(request).await?;

        self.cache.invalidate_all();
        self.prefs.update(|p| p.last_auth_method = Some(method_value));
        self.guard.complete_login(None);
        Ok(session)
    }

    pub async fn adopt_token(&self, token: &str, namespace: Option<&str>) -> Result<Session, AuthError> {
        let session = self.manager.adopt_token(token, namespace).await?;
        self.cache.invalidate_all();
        self.guard.complete_login(None);
        Ok(session)
    }

    pub async fn logout(&self) {
        self.manager.logout().await;
        self.cache.invalidate_all();
    }

    /// Clear a session the server rejected and send the console to login,
    /// remembering `path`.
    pub fn handle_unauthorized(&self, path: &str) -> Location {
        let had_token = self.store.snapshot().has_token();
        self.manager.invalidate();
        self.cache.invalidate_all();
        if had_token {
            self.notifier.emit(
                Notification::new(NotificationLevel::Warning, "Session expired")
                    .with_message("Please log in again."),
            );
        }
        self.guard.redirect_to_login(path)
    }

    /// Feed an API failure back into the session. Returns true if it was
    /// treated as an authentication failure.
    pub fn observe_api_error(&self, err: &ApiError) -> bool {
        if !err.is_auth_failure() || !self.store.snapshot().has_token() {
            return false;
        }
        let path = self.guard.navigator().current_path();
        self.handle_unauthorized(&path);
        true
    }

    pub fn check_expiry(&self) -> bool {
        self.manager.check_expiry()
    }

    // ===== Clients =====

    /// Client for the current token and namespace. Build a fresh one per
    /// operation; it does not follow later session changes.
    pub fn client(&self) -> ApiClient {
        let session = self.store.snapshot();
        self.factory.create(session.token(), session.namespace())
    }

    /// Client for the current token in another namespace.
    pub fn client_for(&self, namespace: Option<&str>) -> ApiClient {
        let session = self.store.snapshot();
        self.factory.create(session.token(), namespace)
    }

    pub fn unauthenticated_client(&self) -> ApiClient {
        self.factory.unauthenticated()
    }

    // ===== Namespaces =====

    pub fn set_namespace(&self, path: Option<&str>) {
        self.switcher.set_namespace(path);
    }

    /// Namespaces below the current one, served from cache while fresh.
    pub async fn namespaces(&self) -> Result<Vec<Namespace>, ApiError> {
        let client = self.client();
        let current = self.store.namespace();
        let result = self
            .cache
            .fetch(current.as_deref(), NAMESPACES_KEY, || async move {
                namespace::list_namespaces(&client).await
            })
            .await;
        if let Err(ref e) = result {
            self.observe_api_error(e);
        }
        result
    }

    pub async fn create_namespace(
        &self,
        path: &str,
        custom_metadata: BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        let result = namespace::create_namespace(&self.client(), path, custom_metadata).await;
        self.after_namespace_write(result)
    }

    pub async fn delete_namespace(&self, path: &str) -> Result<(), ApiError> {
        let result = namespace::delete_namespace(&self.client(), path).await;
        self.after_namespace_write(result)
    }

    fn after_namespace_write(&self, result: Result<(), ApiError>) -> Result<(), ApiError> {
        match result {
            Ok(()) => {
                self.cache.invalidate_prefix(NAMESPACES_KEY);
                Ok(())
            }
            Err(e) => {
                self.observe_api_error(&e);
                Err(e)
            }
        }
    }

    // ===== Seal / unseal =====

    /// Submit one unseal key share. Once the server reports unsealed the
    /// console leaves the unseal route for login. A blank key sends nothing
    /// and returns `None`.
    pub async fn submit_unseal_key(&self, key: &str) -> Result<Option<SealStatus>, ApiError> {
        let key = key.trim();
        if key.is_empty() {
            return Ok(None);
        }
        let status = match self.factory.unauthenticated().unseal(key).await {
            Ok(status) => status,
            Err(e) => {
                self.notifier.emit(
                    Notification::new(NotificationLevel::Error, "Unseal failed").with_message(e.to_string()),
                );
                return Err(e);
            }
        };

        self.poller.record_status(&status);
        if status.sealed {
            info!(progress = status.progress, threshold = status.t, "Unseal key accepted");
        } else {
            self.notifier.emit(Notification::new(NotificationLevel::Success, "Server unsealed"));
            let login = Location::new(self.config.routes.login.clone());
            self.guard.navigate(&login);
        }
        Ok(Some(status))
    }

    /// Discard the key shares submitted so far.
    pub async fn reset_unseal(&self) -> Result<SealStatus, ApiError> {
        let result = self.factory.unauthenticated().unseal_reset().await;
        match &result {
            Ok(status) => {
                self.poller.record_status(status);
                self.notifier.emit(Notification::new(NotificationLevel::Info, "Unseal progress reset"));
            }
            Err(e) => self.notifier.emit(
                Notification::new(NotificationLevel::Error, "Reset failed").with_message(e.to_string()),
            ),
        }
        result
    }

    /// Seal the server with the current token and move to the unseal route.
    pub async fn seal(&self) -> Result<(), ApiError> {
        if let Err(e) = self.client().seal().await {
            self.observe_api_error(&e);
            return Err(e);
        }
        info!("Server sealed");
        self.poller.record_status(&SealStatus {
            sealed: true,
            ..SealStatus::default()
        });
        Ok(())
    }

    /// Remove the persisted session file. The in-memory session is untouched.
    pub fn forget_session(&self) -> Result<()> {
        match &self.session_file {
            Some(file) => file.clear(),
            None => Ok(()),
        }
    }

    // ===== Auth methods =====

    /// Login options for the picker. Never fails; falls back to defaults.
    pub async fn auth_methods(&self) -> Vec<LoginOption> {
        let client = self.factory.unauthenticated();
        let result: Result<Vec<LoginOption>, std::convert::Infallible> = self
            .cache
            .fetch(None, AUTH_METHODS_KEY, || async move { Ok(discover_methods(&client).await) })
            .await;
        match result {
            Ok(options) => options,
            Err(never) => match never {},
        }
    }

    /// The picker value of the last successful login, if still offered.
    pub async fn preferred_auth_method(&self) -> Option<LoginOption> {
        let last = self.prefs.get().last_auth_method?;
        self.auth_methods().await.into_iter().find(|o| o.value == last)
    }

    // ===== Navigation =====

    pub fn navigate(&self, path: &str) -> Location {
        self.guard.navigate(&Location::parse(path))
    }

    pub fn complete_login(&self, redirect_to: Option<&str>) -> Location {
        self.guard.complete_login(redirect_to)
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Method;
    use crate::auth::{LifecycleState, SessionCipher};
    use crate::testing::{MockTransport, RecordingNotifier};
    use serde_json::json;

    struct Harness {
        transport: Arc<MockTransport>,
        navigator: Arc<HistoryNavigator>,
        notifier: Arc<RecordingNotifier>,
        console: Console,
    }

    fn harness(start: &str) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let navigator = Arc::new(HistoryNavigator::new(start));
        let notifier = Arc::new(RecordingNotifier::default());
        let console = Console::builder(ConsoleConfig::default().with_base_url("http://bao.test"))
            .transport(transport.clone())
            .navigator(navigator.clone())
            .notifier(notifier.clone())
            .build()
            .unwrap();
        Harness {
            transport,
            navigator,
            notifier,
            console,
        }
    }

    fn login_reply() -> serde_json::Value {
        json!({"auth": {"client_token": "t1", "accessor": "a", "policies": ["default"],
                        "lease_duration": 3600, "renewable": true}})
    }

    #[tokio::test]
    async fn test_login_records_method_and_navigates() {
        let h = harness("/login?redirect_to=/policies");
        h.transport.respond(Method::Post, "/auth/userpass/login/alice", 200, login_reply());
        h.console.bootstrap().await;

        h.console.login(PendingAuthRequest::userpass("alice", "pw")).await.unwrap();
        assert_eq!(h.navigator.current_path(), "/policies");
        assert_eq!(
            h.console.preferences().get().last_auth_method.as_deref(),
            Some("userpass:userpass/")
        );
        assert_eq!(h.console.client().namespace(), None);
        assert!(h.console.client().has_token());
    }

    #[tokio::test]
    async fn test_namespace_switch_refetches() {
        let h = harness("/");
        h.transport.respond(Method::Post, "/auth/userpass/login/alice", 200, login_reply());
        h.transport.respond(Method::Get, "/sys/namespaces", 200, json!({"data": {"keys": []}}));
        h.console.login(PendingAuthRequest::userpass("alice", "pw")).await.unwrap();

        h.console.namespaces().await.unwrap();
        h.console.namespaces().await.unwrap();
        assert_eq!(h.transport.count(Method::Get, "/sys/namespaces"), 1);

        h.console.set_namespace(Some("team-a"));
        h.console.namespaces().await.unwrap();
        assert_eq!(h.transport.count(Method::Get, "/sys/namespaces"), 2);
        let last = h.transport.requests().pop().unwrap();
        assert_eq!(last.header("X-Vault-Namespace"), Some("team-a"));
    }

    #[tokio::test]
    async fn test_unauthorized_response_logs_out() {
        let h = harness("/");
        h.transport.respond(Method::Post, "/auth/userpass/login/alice", 200, login_reply());
        h.transport.respond(Method::Get, "/sys/namespaces", 403, json!({"errors": ["permission denied"]}));
        h.console.bootstrap().await;
        h.console.login(PendingAuthRequest::userpass("alice", "pw")).await.unwrap();
        h.console.navigate("/access/namespaces");

        assert!(h.console.namespaces().await.is_err());
        assert!(!h.console.session().has_token());
        assert_eq!(
            h.navigator.current(),
            Location::with_redirect("/login", "/access/namespaces")
        );
        assert_eq!(h.notifier.notifications().len(), 1);
        assert_eq!(h.console.manager().state(), LifecycleState::Unauthenticated);
    }

    #[tokio::test]
    async fn test_logout_keeps_namespace_and_redirects() {
        let h = harness("/");
        h.transport.respond(Method::Post, "/auth/userpass/login/alice", 200, login_reply());
        h.console.bootstrap().await;
        h.console.login(PendingAuthRequest::userpass("alice", "pw")).await.unwrap();
        h.console.set_namespace(Some("team-a"));
        h.console.navigate("/secrets");

        h.console.logout().await;
        assert_eq!(h.console.session().namespace(), Some("team-a"));
        assert_eq!(h.navigator.current_path(), "/login");
        assert!(h.console.cache().is_empty());
    }

    #[tokio::test]
    async fn test_unseal_until_unsealed_then_login() {
        let h = harness("/secrets");
        h.transport.respond(Method::Get, "/sys/seal-status", 200, json!({"sealed": true, "t": 2, "progress": 0}));
        h.console.bootstrap().await;
        h.console.poller().poll_once().await;
        assert_eq!(h.navigator.current_path(), "/unseal");

        h.transport.respond(Method::Put, "/sys/unseal", 200, json!({"sealed": true, "t": 2, "progress": 1}));
        h.transport.respond(Method::Put, "/sys/unseal", 200, json!({"sealed": false, "t": 2, "progress": 0}));

        let first = h.console.submit_unseal_key("share-1").await.unwrap().unwrap();
        assert_eq!((first.sealed, first.progress), (true, 1));
        assert_eq!(h.navigator.current_path(), "/unseal");

        let second = h.console.submit_unseal_key(" share-2 ").await.unwrap().unwrap();
        assert!(!second.sealed);
        assert_eq!(h.console.poller().is_sealed(), Some(false));
        assert_eq!(h.navigator.current_path(), "/login");

        let sent = h.transport.requests();
        let last = sent.last().unwrap();
        assert_eq!(last.body, Some(json!({"key": "share-2"})));
        assert_eq!(last.header("X-Vault-Token"), None);
    }

    #[tokio::test]
    async fn test_unseal_failure_notifies() {
        let h = harness("/unseal");
        h.transport.respond(Method::Put, "/sys/unseal", 400, json!({"errors": ["invalid key"]}));

        assert!(h.console.submit_unseal_key("bad").await.is_err());
        assert_eq!(h.console.submit_unseal_key("  ").await, Ok(None));
        assert_eq!(h.transport.count(Method::Put, "/sys/unseal"), 1);
        assert_eq!(h.notifier.notifications().len(), 1);
        assert_eq!(h.navigator.current_path(), "/unseal");
    }

    #[tokio::test]
    async fn test_seal_moves_to_unseal_route() {
        let h = harness("/dashboard");
        h.transport.respond(Method::Post, "/auth/userpass/login/alice", 200, login_reply());
        h.transport.respond(Method::Put, "/sys/seal", 204, json!({}));
        h.console.login(PendingAuthRequest::userpass("alice", "pw")).await.unwrap();

        h.console.seal().await.unwrap();
        assert_eq!(h.console.poller().is_sealed(), Some(true));
        assert_eq!(h.navigator.current_path(), "/unseal");
        let sent = h.transport.requests();
        assert_eq!(sent.last().unwrap().header("X-Vault-Token"), Some("t1"));
    }

    #[tokio::test]
    async fn test_forget_session_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.respond(Method::Post, "/auth/userpass/login/alice", 200, login_reply());
        let file = SessionFile::new(dir.path(), SessionCipher::new([9u8; 32]));
        let path = file.path().to_path_buf();
        let console = Console::builder(ConsoleConfig::default())
            .transport(transport)
            .session_file(file)
            .build()
            .unwrap();
        console.bootstrap().await;
        console.login(PendingAuthRequest::userpass("alice", "pw")).await.unwrap();
        assert!(path.exists());

        console.forget_session().unwrap();
        assert!(!path.exists());
        assert!(console.session().has_token());
    }

    #[tokio::test]
    async fn test_auth_methods_cached() {
        let h = harness("/login");
        h.transport.respond(Method::Get, "/sys/auth", 200, json!({"token/": {"type": "token"}}));
        assert_eq!(h.console.auth_methods().await.len(), 1);
        assert_eq!(h.console.auth_methods().await.len(), 1);
        assert_eq!(h.transport.count(Method::Get, "/sys/auth"), 1);
    }

    #[tokio::test]
    async fn test_session_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let key = [3u8; 32];
        let transport = Arc::new(MockTransport::new());
        transport.respond(Method::Post, "/auth/userpass/login/alice", 200, login_reply());
        transport.respond(
            Method::Get,
            "/auth/token/lookup-self",
            200,
            json!({"data": {"accessor": "a", "ttl": 3000, "renewable": true, "policies": ["default"]}}),
        );

        let build = || {
            Console::builder(ConsoleConfig::default())
                .transport(transport.clone())
                .session_file(SessionFile::new(dir.path(), SessionCipher::new(key)))
                .build()
                .unwrap()
        };

        let first = build();
        first.bootstrap().await;
        first.login(PendingAuthRequest::userpass("alice", "pw")).await.unwrap();
        first.set_namespace(Some("team-a"));
        drop(first);

        let second = build();
        assert!(second.bootstrap().await);
        let session = second.session();
        assert_eq!(session.token(), Some("t1"));
        assert_eq!(session.namespace(), Some("team-a"));
        assert_eq!(session.token_meta().unwrap().ttl_seconds, 3000);
    }
}
