use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{AuthBlock, TokenLookup};

/// How the root namespace is spelled when a caller spells it at all.
pub const ROOT_NAMESPACE: &str = "/";

/// Tokens reported with a zero TTL never expire (root tokens).
/// They are modelled with an expiry far enough out to never trip the buffer;
/// reported TTLs are clamped to the same ceiling.
const NON_EXPIRING_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Canonical form of a namespace for comparisons: surrounding slashes
/// stripped, root mapped to `None`.
pub fn canonical_namespace(namespace: Option<&str>) -> Option<&str> {
    namespace.map(|ns| ns.trim().trim_matches('/')).filter(|ns| !ns.is_empty())
}

/// `None`, `""` and `"/"` all denote the root namespace.
pub fn is_root_namespace(namespace: Option<&str>) -> bool {
    canonical_namespace(namespace).is_none()
}

/// Compare two namespaces, treating every spelling of root as equal and
/// ignoring leading/trailing slashes.
pub fn same_namespace(a: Option<&str>, b: Option<&str>) -> bool {
    canonical_namespace(a) == canonical_namespace(b)
}

/// Metadata about the current token, as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct TokenMeta {
    pub accessor: String,
    pub ttl_seconds: u64,
    pub renewable: bool,
    pub policies: Vec<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TokenMeta {
    /// Build metadata whose expiry is `ttl_seconds` from now.
    pub fn new(accessor: impl Into<String>, ttl_seconds: u64, renewable: bool, policies: Vec<String>) -> Self {
        Self {
            accessor: accessor.into(),
            ttl_seconds,
            renewable,
            policies,
            expires_at: Self::expiry_from_now(ttl_seconds),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    fn expiry_from_now(ttl_seconds: u64) -> DateTime<Utc> {
        let secs = match i64::try_from(ttl_seconds) {
            Ok(0) | Err(_) => NON_EXPIRING_SECS,
            Ok(ttl) => ttl.min(NON_EXPIRING_SECS),
        };
        Utc::now() + Duration::seconds(secs)
    }

    pub fn from_auth(auth: &AuthBlock) -> Self {
        Self::new(auth.accessor.clone(), auth.lease_duration, auth.renewable, auth.policies.clone())
            .with_metadata(auth.metadata.clone().unwrap_or_default())
    }

    pub fn from_lookup(lookup: &TokenLookup) -> Self {
        Self::new(lookup.accessor.clone(), lookup.ttl, lookup.renewable, lookup.policies.clone())
            .with_metadata(lookup.meta.clone().unwrap_or_default())
    }

    /// True once `now` is at or past the expiry.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// True if the token expires within `buffer` from now.
    pub fn expires_within(&self, buffer: Duration) -> bool {
        Utc::now() + buffer >= self.expires_at
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }

    /// Renewal fires at half the TTL: `ttl_seconds * 500` milliseconds.
    pub fn renewal_delay(&self) -> StdDuration {
        StdDuration::from_millis(self.ttl_seconds.saturating_mul(500))
    }

    /// Whether a renewal timer makes sense for this token at all.
    pub fn wants_renewal(&self) -> bool {
        self.renewable && self.ttl_seconds > 0
    }
}

/// A partial update to [`TokenMeta`], applied after a renewal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenMetaUpdate {
    pub accessor: Option<String>,
    pub ttl_seconds: Option<u64>,
    pub renewable: Option<bool>,
    pub policies: Option<Vec<String>>,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl TokenMetaUpdate {
    /// A renew-self response. Empty fields keep the previous values.
    pub fn from_auth(auth: &AuthBlock) -> Self {
        Self {
            accessor: Some(auth.accessor.clone()).filter(|a| !a.is_empty()),
            ttl_seconds: Some(auth.lease_duration).filter(|ttl| *ttl > 0),
            renewable: Some(auth.renewable),
            policies: Some(auth.policies.clone()).filter(|p| !p.is_empty()),
            metadata: auth.metadata.clone(),
        }
    }

    /// Merge into `meta`. A new TTL restarts the expiry clock from now.
    pub(crate) fn apply(self, meta: &mut TokenMeta) {
        if let Some(accessor) = self.accessor {
            meta.accessor = accessor;
        }
        if let Some(ttl) = self.ttl_seconds {
            meta.ttl_seconds = ttl;
            meta.expires_at = TokenMeta::expiry_from_now(ttl);
        }
        if let Some(renewable) = self.renewable {
            meta.renewable = renewable;
        }
        if let Some(policies) = self.policies {
            meta.policies = policies;
        }
        if let Some(metadata) = self.metadata {
            meta.metadata = metadata;
        }
    }
}

/// The console's view of who it is talking as, and where.
///
/// `token` and `token_meta` are always both present or both absent; only
/// [`super::SessionStore`] constructs authenticated sessions.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Session {
    pub(crate) token: Option<String>,
    pub(crate) token_meta: Option<TokenMeta>,
    pub(crate) namespace: Option<String>,
}

impl Session {
    /// An unauthenticated session in `namespace`.
    pub fn anonymous(namespace: Option<String>) -> Self {
        Self {
            token: None,
            token_meta: None,
            namespace,
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn token_meta(&self) -> Option<&TokenMeta> {
        self.token_meta.as_ref()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Token present and its expiry still more than `buffer` away.
    pub fn is_valid_with_buffer(&self, buffer: Duration) -> bool {
        match (&self.token, &self.token_meta) {
            (Some(_), Some(meta)) => !meta.expires_within(buffer),
            _ => false,
        }
    }

    /// Token present and already past its expiry.
    pub fn is_expired(&self) -> bool {
        self.token_meta.as_ref().map(TokenMeta::is_expired).unwrap_or(false)
    }

    /// The token/metadata pairing holds.
    pub fn is_consistent(&self) -> bool {
        self.token.is_some() == self.token_meta.is_some()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_meta", &self.token_meta)
            .field("namespace", &self.namespace)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_namespace_spellings() {
        assert!(is_root_namespace(None));
        assert!(is_root_namespace(Some("/")));
        assert!(is_root_namespace(Some("")));
        assert!(!is_root_namespace(Some("team-a")));
    }

    #[test]
    fn test_same_namespace_tolerates_slashes() {
        assert!(same_namespace(None, Some("/")));
        assert!(same_namespace(Some("team-a/"), Some("team-a")));
        assert!(same_namespace(Some("/org/team"), Some("org/team/")));
        assert!(!same_namespace(Some("team-a"), None));
        assert!(!same_namespace(Some("team-a"), Some("team-b")));
    }

    #[test]
    fn test_renewal_delay_is_half_ttl() {
        let meta = TokenMeta::new("acc", 3600, true, vec![]);
        assert_eq!(meta.renewal_delay(), StdDuration::from_secs(1800));
        assert!(meta.wants_renewal());
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let meta = TokenMeta::new("root", 0, false, vec!["root".to_string()]);
        assert!(!meta.expires_within(Duration::minutes(5)));
        assert!(!meta.wants_renewal());
    }

    #[test]
    fn test_update_keeps_unset_fields() {
        let mut meta = TokenMeta::new("acc", 60, true, vec!["default".to_string()]);
        let before = meta.expires_at;
        TokenMetaUpdate {
            ttl_seconds: Some(7200),
            ..Default::default()
        }
        .apply(&mut meta);
        assert_eq!(meta.accessor, "acc");
        assert_eq!(meta.policies, vec!["default".to_string()]);
        assert_eq!(meta.ttl_seconds, 7200);
        assert!(meta.expires_at > before);
    }

    #[test]
    fn test_update_from_auth_ignores_empty_fields() {
        let auth = AuthBlock {
            lease_duration: 0,
            renewable: false,
            ..Default::default()
        };
        let update = TokenMetaUpdate::from_auth(&auth);
        assert_eq!(update.ttl_seconds, None);
        assert_eq!(update.accessor, None);
        assert_eq!(update.renewable, Some(false));
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let session = Session {
            token: Some("s.very-secret".to_string()),
            token_meta: Some(TokenMeta::new("acc", 60, false, vec![])),
            namespace: None,
        };
        let rendered = format!("{:?}", session);
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("redacted"));
    }
}
