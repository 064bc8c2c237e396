//! Token lifecycle: login, scheduled renewal, revocation and expiry.
//!
//! The manager is the only writer of the token half of the session. Every
//! identity change bumps the store generation, and every async write-back
//! (renewal results, post-logout state changes) is checked against the
//! generation it started under. A logout therefore always wins over a
//! renewal that resolves after it.
//!
//! Renewal runs as one tokio task per session, tracked by its `JoinHandle`.
//! The task holds only a weak reference to the manager and re-reads the
//! current session each time it fires.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::method::{AuthMethod, PendingAuthRequest};
use super::AuthError;
use crate::api::{ApiError, ClientFactory};
use crate::session::{NamespacePolicy, Session, SessionStore, TokenMeta, TokenMetaUpdate};

/// Where the manager is in the token lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub enum LifecycleState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Renewing,
    Expired,
    LoggedOut,
}

/// Result of a renewal attempt that reached a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    /// Metadata updated from the server's answer.
    Renewed,
    /// The session changed while the request was in flight; the answer was dropped.
    Discarded,
    /// The current token cannot be renewed; nothing was sent.
    NotRenewable,
}

struct RenewalTimer {
    handle: JoinHandle<()>,
    generation: u64,
}

struct ManagerInner {
    store: SessionStore,
    factory: ClientFactory,
    state: watch::Sender<LifecycleState>,
    timer: Mutex<Option<RenewalTimer>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<ManagerInner>,
}

impl TokenManager {
    pub fn new(store: SessionStore, factory: ClientFactory) -> Self {
        let initial = if store.is_authenticated() {
            LifecycleState::Authenticated
        } else {
            LifecycleState::Unauthenticated
        };
        let (state, _) = watch::channel(initial);
        Self {
            inner: Arc::new(ManagerInner {
                store,
                factory,
                state,
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// True while a renewal task is armed for the current session.
    pub fn renewal_pending(&self) -> bool {
        let generation = self.inner.store.generation();
        self.inner
            .timer
            .lock()
            .as_ref()
            .map(|t| t.generation == generation && !t.handle.is_finished())
            .unwrap_or(false)
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "Lifecycle state changed");
        }
    }

    /// Only move the state machine if the session is still `generation`.
    fn set_state_if(&self, generation: u64, state: LifecycleState) {
        if self.inner.store.generation() == generation {
            self.set_state(state);
        }
    }

    // ===== Login =====

    /// Authenticate with the gathered credentials and install the session.
    ///
    /// Credentials are checked locally first; a missing field fails without
    /// any network call. External methods (OIDC, GitHub) cannot log in here
    /// and return [`AuthError::ExternalMethod`]; their token is installed
    /// afterwards with [`adopt_token`](Self::adopt_token).
    pub async fn login(&self, request: PendingAuthRequest) -> Result<Session, AuthError> {
        let plan = LoginPlan::from_request(&request)?;
        let namespace = request.namespace.clone().or_else(|| self.inner.store.namespace());
        let was_authenticated = self.inner.store.is_authenticated();

        self.set_state(LifecycleState::Authenticating);
        debug!(method = %request.method, namespace = ?namespace, "Logging in");

        let result = self.authenticate(&request, plan, namespace.as_deref()).await;
        match result {
            Ok((token, meta)) => {
                let generation =
                    self.inner
                        .store
                        .set_authenticated(token, meta.clone(), request.namespace.as_deref());
                self.arm_renewal(generation, meta.renewal_delay(), &meta);
                self.set_state(LifecycleState::Authenticated);
                info!(
                    method = %request.method,
                    ttl = meta.ttl_seconds,
                    renewable = meta.renewable,
                    "Login successful"
                );
                Ok(self.inner.store.snapshot())
            }
            Err(e) => {
                warn!(method = %request.method, error = %e, "Login failed");
                self.set_state(if was_authenticated && self.inner.store.is_authenticated() {
                    LifecycleState::Authenticated
                } else {
                    LifecycleState::Unauthenticated
                });
                Err(e)
            }
        }
    }

    /// Install a token obtained outside the console (e.g. after an OIDC
    /// redirect). Behaves exactly like a token login.
    pub async fn adopt_token(&self, token: &str, namespace: Option<&str>) -> Result<Session, AuthError> {
        let mut request = PendingAuthRequest::token(token);
        request.namespace = namespace.map(str::to_string);
        self.login(request).await
    }

    async fn authenticate(
        &self,
        request: &PendingAuthRequest,
        plan: LoginPlan,
        namespace: Option<&str>,
    ) -> Result<(String, TokenMeta), AuthError> {
        match plan {
            LoginPlan::Lookup { token } => {
                let client = self.inner.factory.create(Some(&token), namespace);
                let lookup = client.lookup_self().await?;
                Ok((token, TokenMeta::from_lookup(&lookup)))
            }
            LoginPlan::Post { username, body } => {
                let client = self.inner.factory.create(None, namespace);
                let auth = client.login(&request.mount(), username.as_deref(), body).await?;
                if auth.client_token.is_empty() {
                    return Err(AuthError::Unknown("login response carried no token".to_string()));
                }
                let meta = TokenMeta::from_auth(&auth);
                Ok((auth.client_token, meta))
            }
        }
    }

    // ===== Logout / expiry =====

    /// Clear the session locally, then revoke the token on a best-effort
    /// basis. The namespace selection survives.
    pub async fn logout(&self) {
        self.cancel_renewal();
        let previous = self.inner.store.snapshot();
        let generation = self.inner.store.clear(NamespacePolicy::Preserve);
        self.set_state(LifecycleState::LoggedOut);

        if let Some(token) = previous.token() {
            let client = self.inner.factory.create(Some(token), previous.namespace());
            match client.revoke_self().await {
                Ok(()) => debug!("Token revoked"),
                Err(e) => debug!(error = %e, "Token revocation failed, session cleared anyway"),
            }
        }

        self.set_state_if(generation, LifecycleState::Unauthenticated);
        info!("Logged out");
    }

    /// Drop a session the server no longer accepts (401/403 on a real request).
    pub fn invalidate(&self) {
        if !self.inner.store.snapshot().has_token() {
            return;
        }
        self.cancel_renewal();
        self.inner.store.clear(NamespacePolicy::Preserve);
        self.set_state(LifecycleState::Unauthenticated);
        info!("Session invalidated by server");
    }

    /// Clear the session if its token is past expiry. Returns true if it was.
    pub fn check_expiry(&self) -> bool {
        if !self.inner.store.is_expired() {
            return false;
        }
        self.cancel_renewal();
        self.inner.store.clear(NamespacePolicy::Preserve);
        self.set_state(LifecycleState::Expired);
        info!("Session expired");
        true
    }

    /// Stop the renewal task without touching the session.
    pub fn shutdown(&self) {
        self.cancel_renewal();
    }

    /// Install a persisted session and re-verify it against the server.
    ///
    /// A token the server rejects is dropped. When the server cannot be
    /// reached the session is kept as-is so the console works offline until
    /// the next real request decides. Returns whether a session is active.
    pub async fn resume(&self, session: Session) -> bool {
        let Some(token) = session.token().map(str::to_string) else {
            self.inner.store.restore(Session::anonymous(session.namespace.clone()));
            return false;
        };
        if session.is_expired() {
            debug!("Persisted session already expired");
            self.inner.store.restore(Session::anonymous(session.namespace.clone()));
            return false;
        }

        let namespace = session.namespace.clone();
        let generation = self.inner.store.restore(session);
        let client = self.inner.factory.create(Some(&token), namespace.as_deref());

        let meta = match client.lookup_self().await {
            Ok(lookup) => {
                let meta = TokenMeta::from_lookup(&lookup);
                self.inner.store.update_token_meta_if(
                    generation,
                    TokenMetaUpdate {
                        accessor: Some(meta.accessor.clone()),
                        ttl_seconds: Some(meta.ttl_seconds),
                        renewable: Some(meta.renewable),
                        policies: Some(meta.policies.clone()),
                        metadata: Some(meta.metadata.clone()),
                    },
                );
                meta
            }
            Err(e) if e.is_auth_failure() => {
                info!("Persisted token rejected by server");
                if self.inner.store.generation() == generation {
                    self.inner.store.clear(NamespacePolicy::Preserve);
                    self.set_state(LifecycleState::Unauthenticated);
                }
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Could not verify persisted session, keeping it");
                match self.inner.store.token_meta() {
                    Some(meta) => meta,
                    None => return false,
                }
            }
        };

        if self.inner.store.generation() != generation {
            return self.inner.store.is_authenticated();
        }
        // Renew halfway through whatever lifetime remains.
        let remaining = meta.time_until_expiry().to_std().unwrap_or_default();
        self.arm_renewal(generation, meta.renewal_delay().min(remaining / 2), &meta);
        self.set_state(LifecycleState::Authenticated);
        true
    }

    // ===== Renewal =====

    /// Renew the current token now and re-arm the timer relative to now.
    pub async fn renew(&self) -> Result<RenewOutcome, AuthError> {
        let generation = self.inner.store.generation();
        let outcome = self.renew_for(generation).await?;
        if outcome == RenewOutcome::Renewed {
            if let Some(meta) = self.inner.store.token_meta() {
                self.arm_renewal(generation, meta.renewal_delay(), &meta);
            }
        }
        Ok(outcome)
    }

    /// One renew-self round trip for the session identified by `generation`.
    /// The client is built from the session as it is now.
    async fn renew_for(&self, generation: u64) -> Result<RenewOutcome, AuthError> {
        let (session, current) = self.inner.store.versioned_snapshot();
        if current != generation {
            return Ok(RenewOutcome::Discarded);
        }
        let (token, meta) = match (session.token(), session.token_meta()) {
            (Some(token), Some(meta)) => (token, meta),
            _ => return Err(AuthError::NotAuthenticated),
        };
        if !meta.renewable {
            return Ok(RenewOutcome::NotRenewable);
        }

        self.set_state(LifecycleState::Renewing);
        let client = self.inner.factory.create(Some(token), session.namespace());
        match client.renew_self().await {
            Ok(auth) => {
                if self
                    .inner
                    .store
                    .update_token_meta_if(generation, TokenMetaUpdate::from_auth(&auth))
                {
                    self.set_state(LifecycleState::Authenticated);
                    debug!(ttl = auth.lease_duration, "Token renewed");
                    Ok(RenewOutcome::Renewed)
                } else {
                    debug!("Discarding renewal for a replaced session");
                    Ok(RenewOutcome::Discarded)
                }
            }
            Err(e) => {
                self.set_state_if(generation, LifecycleState::Authenticated);
                warn!(error = %e, "Token renewal failed");
                Err(renewal_error(e))
            }
        }
    }

    /// Replace any armed timer with one for `generation` firing after `delay`.
    /// The previous timer is aborted and the new one installed under a single
    /// lock, so concurrent callers cannot leave a timer running untracked.
    fn arm_renewal(&self, generation: u64, delay: Duration, meta: &TokenMeta) {
        let mut timer = self.inner.timer.lock();
        if let Some(previous) = timer.take() {
            previous.handle.abort();
        }
        if !meta.wants_renewal() {
            debug!("Token not renewable, no renewal scheduled");
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No async runtime, renewal not scheduled");
                return;
            }
        };

        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(renewal_loop(weak, generation, delay));
        debug!(delay_secs = delay.as_secs(), "Renewal scheduled");
        *timer = Some(RenewalTimer { handle, generation });
    }

    fn cancel_renewal(&self) {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.handle.abort();
        }
    }
}

fn renewal_error(err: ApiError) -> AuthError {
    match AuthError::from(err) {
        AuthError::Unknown(msg) => AuthError::RenewalFailed(msg),
        other => other,
    }
}

/// Sleep, renew, repeat. Failures retry after the same delay until the
/// token is gone or expired.
async fn renewal_loop(weak: Weak<ManagerInner>, generation: u64, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let manager = TokenManager { inner };

        match manager.renew_for(generation).await {
            Ok(RenewOutcome::Renewed) => match manager.inner.store.token_meta() {
                Some(meta) if meta.wants_renewal() => delay = meta.renewal_delay(),
                _ => return,
            },
            Ok(RenewOutcome::Discarded) | Ok(RenewOutcome::NotRenewable) => return,
            Err(_) => {
                if manager.inner.store.generation() != generation || manager.check_expiry() {
                    return;
                }
                debug!(retry_secs = delay.as_secs(), "Retrying renewal");
            }
        }
    }
}

// ============================================================================
// Request validation
// ============================================================================

enum LoginPlan {
    /// Token login: verify with lookup-self.
    Lookup { token: String },
    /// Backend login: POST to `/auth/{mount}/login[/{username}]`.
    Post { username: Option<String>, body: Value },
}

impl LoginPlan {
    fn from_request(request: &PendingAuthRequest) -> Result<Self, AuthError> {
        let required = |names: &[&str], label: &'static str| {
            request
                .get(names)
                .map(str::to_string)
                .ok_or(AuthError::MissingCredential(label))
        };

        match &request.method {
            method if method.is_external() => Err(AuthError::ExternalMethod(method.label().to_string())),
            AuthMethod::Token => Ok(LoginPlan::Lookup {
                token: required(&["token"], "token")?,
            }),
            AuthMethod::Userpass | AuthMethod::Ldap => {
                let (user_keys, pass_keys): (&[&str], &[&str]) = if request.method == AuthMethod::Ldap {
                    (&["username", "ldap_username"], &["password", "ldap_password"])
                } else {
                    (&["username"], &["password"])
                };
                let username = required(user_keys, "username")?;
                let password = required(pass_keys, "password")?;
                if username.contains('/') {
                    return Err(AuthError::InvalidInput("username must not contain '/'".to_string()));
                }
                Ok(LoginPlan::Post {
                    username: Some(username),
                    body: json!({ "password": password }),
                })
            }
            AuthMethod::Approle => Ok(LoginPlan::Post {
                username: None,
                body: json!({
                    "role_id": required(&["role_id"], "role_id")?,
                    "secret_id": required(&["secret_id"], "secret_id")?,
                }),
            }),
            AuthMethod::Jwt => {
                let mut body = Map::new();
                body.insert("jwt".to_string(), Value::String(required(&["jwt"], "jwt")?));
                if let Some(role) = request.get(&["role"]) {
                    body.insert("role".to_string(), Value::String(role.to_string()));
                }
                Ok(LoginPlan::Post {
                    username: None,
                    body: Value::Object(body),
                })
            }
            other => Err(AuthError::UnsupportedMethod(other.to_string())),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
