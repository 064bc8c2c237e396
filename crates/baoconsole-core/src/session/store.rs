//! The single owned store for the console session.
//!
//! All writes are whole-state transitions under one lock, so readers never
//! see a token without its metadata. Each identity change (login, clear)
//! bumps a generation counter; async work that started under an older
//! generation can check it before writing back.
//!
//! Subscribers run synchronously after every mutation, in registration
//! order, outside the lock, so they may read the store freely.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use parking_lot::Mutex;
use tracing::debug;

use super::model::{Session, TokenMeta, TokenMetaUpdate};

/// Tokens within this window of expiry no longer count as authenticated,
/// so a request is never started with a token that dies mid-flight.
pub const DEFAULT_EXPIRY_BUFFER: StdDuration = StdDuration::from_secs(5 * 60);

pub type Subscriber = Arc<dyn Fn(&Session) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// What `clear` does with the selected namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamespacePolicy {
    /// Keep the namespace across logout/login.
    #[default]
    Preserve,
    /// Drop back to root.
    Clear,
}

struct Inner {
    session: Session,
    generation: u64,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: u64,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<Inner>>,
    expiry_buffer: Duration,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_expiry_buffer(DEFAULT_EXPIRY_BUFFER)
    }

    pub fn with_expiry_buffer(buffer: StdDuration) -> Self {
        let expiry_buffer = Duration::from_std(buffer).unwrap_or_else(|_| Duration::minutes(5));
        Self {
            inner: Arc::new(Mutex::new(Inner {
                session: Session::default(),
                generation: 0,
                subscribers: Vec::new(),
                next_subscription: 0,
            })),
            expiry_buffer,
        }
    }

    pub fn snapshot(&self) -> Session {
        self.inner.lock().session.clone()
    }

    /// Identity generation; changes on every login and clear.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Snapshot and generation read under the same lock.
    pub fn versioned_snapshot(&self) -> (Session, u64) {
        let inner = self.inner.lock();
        (inner.session.clone(), inner.generation)
    }

    pub fn token(&self) -> Option<String> {
        self.inner.lock().session.token.clone()
    }

    pub fn namespace(&self) -> Option<String> {
        self.inner.lock().session.namespace.clone()
    }

    pub fn token_meta(&self) -> Option<TokenMeta> {
        self.inner.lock().session.token_meta.clone()
    }

    /// Token present and `now + buffer` still before its expiry.
    pub fn is_authenticated(&self) -> bool {
        self.inner.lock().session.is_valid_with_buffer(self.expiry_buffer)
    }

    /// Token present and already past its expiry.
    pub fn is_expired(&self) -> bool {
        self.inner.lock().session.is_expired()
    }

    // ===== Mutations =====

    /// Replace the whole session. `namespace: None` keeps the current one.
    /// Returns the new generation.
    pub fn set_authenticated(&self, token: String, meta: TokenMeta, namespace: Option<&str>) -> u64 {
        self.mutate(|inner| {
            let namespace = match namespace {
                Some(ns) => Some(ns.to_string()),
                None => inner.session.namespace.take(),
            };
            inner.session = Session {
                token: Some(token),
                token_meta: Some(meta),
                namespace,
            };
            inner.generation += 1;
            debug!(generation = inner.generation, "Session authenticated");
            inner.generation
        })
    }

    /// Merge a metadata update into the current token. The token itself is
    /// never touched. Returns false when there is no session to update.
    pub fn update_token_meta(&self, update: TokenMetaUpdate) -> bool {
        self.mutate_if(|inner| match inner.session.token_meta.as_mut() {
            Some(meta) => {
                update.apply(meta);
                true
            }
            None => false,
        })
    }

    /// Like [`update_token_meta`](Self::update_token_meta), but only while the
    /// session is still the one identified by `generation`.
    pub fn update_token_meta_if(&self, generation: u64, update: TokenMetaUpdate) -> bool {
        self.mutate_if(|inner| {
            if inner.generation != generation {
                debug!(
                    expected = generation,
                    current = inner.generation,
                    "Dropping metadata update for a replaced session"
                );
                return false;
            }
            match inner.session.token_meta.as_mut() {
                Some(meta) => {
                    update.apply(meta);
                    true
                }
                None => false,
            }
        })
    }

    /// Drop token and metadata. Returns the new generation.
    pub fn clear(&self, policy: NamespacePolicy) -> u64 {
        self.mutate(|inner| {
            inner.session.token = None;
            inner.session.token_meta = None;
            if policy == NamespacePolicy::Clear {
                inner.session.namespace = None;
            }
            inner.generation += 1;
            debug!(generation = inner.generation, ?policy, "Session cleared");
            inner.generation
        })
    }

    /// Store `namespace` verbatim. Writers go through the namespace switcher.
    pub(crate) fn set_namespace(&self, namespace: Option<String>) {
        self.mutate(|inner| {
            inner.session.namespace = namespace;
        });
    }

    /// Install a previously persisted session. Sessions that break the
    /// token/metadata pairing are reduced to their namespace.
    pub(crate) fn restore(&self, session: Session) -> u64 {
        self.mutate(|inner| {
            inner.session = if session.is_consistent() {
                session
            } else {
                Session::anonymous(session.namespace)
            };
            inner.generation += 1;
            inner.generation
        })
    }

    // ===== Subscriptions =====

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next_subscription);
        inner.next_subscription += 1;
        inner.subscribers.push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sid, _)| *sid != id);
        inner.subscribers.len() != before
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let (result, session, subscribers) = {
            let mut inner = self.inner.lock();
            let result = f(&mut inner);
            let subscribers: Vec<Subscriber> =
                inner.subscribers.iter().map(|(_, s)| Arc::clone(s)).collect();
            (result, inner.session.clone(), subscribers)
        };
        for subscriber in subscribers {
            subscriber(&session);
        }
        result
    }

    /// Mutate and notify only when `f` reports a change.
    fn mutate_if(&self, f: impl FnOnce(&mut Inner) -> bool) -> bool {
        let notify = {
            let mut inner = self.inner.lock();
            if !f(&mut inner) {
                return false;
            }
            let subscribers: Vec<Subscriber> =
                inner.subscribers.iter().map(|(_, s)| Arc::clone(s)).collect();
            (inner.session.clone(), subscribers)
        };
        let (session, subscribers) = notify;
        for subscriber in subscribers {
            subscriber(&session);
        }
        true
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn meta_expiring_in(minutes: i64) -> TokenMeta {
        let mut meta = TokenMeta::new("acc", 3600, true, vec!["default".to_string()]);
        meta.expires_at = chrono::Utc::now() + Duration::minutes(minutes);
        meta
    }

    #[test]
    fn test_expiry_buffer() {
        let store = SessionStore::new();
        store.set_authenticated("t1".to_string(), meta_expiring_in(4), None);
        assert!(!store.is_authenticated());
        assert!(!store.is_expired());

        store.set_authenticated("t1".to_string(), meta_expiring_in(10), None);
        assert!(store.is_authenticated());
    }

    #[test]
    fn test_expired_token() {
        let store = SessionStore::new();
        store.set_authenticated("t1".to_string(), meta_expiring_in(-1), None);
        assert!(store.is_expired());
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_token_and_meta_stay_coupled() {
        let store = SessionStore::new();
        let check = |store: &SessionStore| {
            let s = store.snapshot();
            assert_eq!(s.token().is_some(), s.token_meta().is_some());
        };

        check(&store);
        assert!(!store.update_token_meta(TokenMetaUpdate::default()));
        check(&store);
        store.set_authenticated("t1".to_string(), meta_expiring_in(60), Some("team-a"));
        check(&store);
        store.update_token_meta(TokenMetaUpdate {
            ttl_seconds: Some(10),
            ..Default::default()
        });
        check(&store);
        store.set_namespace(None);
        check(&store);
        store.clear(NamespacePolicy::Preserve);
        check(&store);
        store.restore(Session {
            token: Some("orphan".to_string()),
            token_meta: None,
            namespace: Some("team-b".to_string()),
        });
        check(&store);
        assert_eq!(store.namespace().as_deref(), Some("team-b"));
    }

    #[test]
    fn test_update_preserves_token() {
        let store = SessionStore::new();
        store.set_authenticated("t1".to_string(), meta_expiring_in(60), None);
        store.update_token_meta(TokenMetaUpdate {
            policies: Some(vec!["admin".to_string()]),
            ..Default::default()
        });
        let snapshot = store.snapshot();
        assert_eq!(snapshot.token(), Some("t1"));
        assert_eq!(snapshot.token_meta().unwrap().policies, vec!["admin".to_string()]);
    }

    #[test]
    fn test_generation_guards_updates() {
        let store = SessionStore::new();
        let generation = store.set_authenticated("t1".to_string(), meta_expiring_in(60), None);
        store.clear(NamespacePolicy::Preserve);

        let applied = store.update_token_meta_if(
            generation,
            TokenMetaUpdate {
                ttl_seconds: Some(3600),
                ..Default::default()
            },
        );
        assert!(!applied);
        assert!(store.snapshot().token().is_none());
    }

    #[test]
    fn test_clear_namespace_policy() {
        let store = SessionStore::new();
        store.set_authenticated("t1".to_string(), meta_expiring_in(60), Some("team-a"));
        store.clear(NamespacePolicy::Preserve);
        assert_eq!(store.namespace().as_deref(), Some("team-a"));

        store.set_authenticated("t1".to_string(), meta_expiring_in(60), None);
        assert_eq!(store.namespace().as_deref(), Some("team-a"));
        store.clear(NamespacePolicy::Clear);
        assert_eq!(store.namespace(), None);
    }

    #[test]
    fn test_subscribers_notified_in_order() {
        let store = SessionStore::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&log);
        store.subscribe(move |s| first.lock().push(("first", s.has_token())));
        let second = Arc::clone(&log);
        let id = store.subscribe(move |s| second.lock().push(("second", s.has_token())));

        store.set_authenticated("t1".to_string(), meta_expiring_in(60), None);
        assert_eq!(*log.lock(), vec![("first", true), ("second", true)]);

        assert!(store.unsubscribe(id));
        store.clear(NamespacePolicy::Preserve);
        assert_eq!(log.lock().last(), Some(&("first", false)));
        assert_eq!(log.lock().len(), 3);
    }

    #[test]
    fn test_subscriber_may_read_store() {
        let store = SessionStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let reader = store.clone();
        let counter = Arc::clone(&seen);
        store.subscribe(move |_| {
            if reader.is_authenticated() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        store.set_authenticated("t1".to_string(), meta_expiring_in(60), None);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
