use tracing::info;

use crate::cache::QueryCache;
use crate::config::PreferenceStore;
use crate::session::{canonical_namespace, is_root_namespace, SessionStore};

/// Changes the active namespace.
///
/// Every switch clears the query cache before returning, so nothing fetched
/// in the old namespace can be served, or stored, afterwards.
#[derive(Clone)]
pub struct NamespaceSwitcher {
    store: SessionStore,
    cache: QueryCache,
    prefs: PreferenceStore,
}

impl NamespaceSwitcher {
    pub fn new(store: SessionStore, cache: QueryCache, prefs: PreferenceStore) -> Self {
        Self { store, cache, prefs }
    }

    pub fn current(&self) -> Option<String> {
        self.store.namespace()
    }

    /// Switch to `path`, stored as given. `None`, `""` and `"/"` select root.
    pub fn set_namespace(&self, path: Option<&str>) {
        let stored = path.filter(|p| !p.is_empty()).map(str::to_string);
        self.store.set_namespace(stored);
        self.cache.invalidate_all();

        let persisted = canonical_namespace(path).map(str::to_string);
        self.prefs.update(|p| p.last_namespace = persisted);
        if is_root_namespace(path) {
            info!("Switched to root namespace");
        } else {
            info!(namespace = path.unwrap_or_default(), "Switched namespace");
        }
    }

    /// Re-select the persisted namespace if the session has none.
    pub fn restore(&self) -> Option<String> {
        if !is_root_namespace(self.store.namespace().as_deref()) {
            return self.store.namespace();
        }
        let saved = self.prefs.get().last_namespace?;
        self.store.set_namespace(Some(saved.clone()));
        self.cache.invalidate_all();
        Some(saved)
    }
}
