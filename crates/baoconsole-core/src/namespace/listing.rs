//! Namespace listing and detail enrichment.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::api::{ApiClient, ApiError, ListResponse, NamespaceDetail};

/// Detail reads issued concurrently when the listing carries no key info.
const MAX_CONCURRENT_READS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Namespace {
    /// Listing key, e.g. `team-a/`.
    pub path: String,
    pub id: Option<String>,
    pub locked: Option<bool>,
    pub tainted: Option<bool>,
    pub uuid: Option<String>,
    #[cfg_attr(feature = "ts", ts(type = "Record<string, unknown> | null"))]
    pub custom_metadata: Option<BTreeMap<String, Value>>,
}

impl Namespace {
    pub fn basic(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    /// Path without the trailing slash, as it goes into `X-Vault-Namespace`.
    pub fn name(&self) -> &str {
        self.path.trim_end_matches('/')
    }

    fn from_detail(key: &str, detail: NamespaceDetail) -> Self {
        Self {
            path: detail.path.filter(|p| !p.is_empty()).unwrap_or_else(|| key.to_string()),
            uuid: detail.uuid.or_else(|| detail.id.clone()),
            id: detail.id,
            locked: detail.locked,
            tainted: detail.tainted,
            custom_metadata: detail.custom_metadata,
        }
    }

    /// One `key_info` entry. Fields with the wrong JSON type are ignored.
    fn from_key_info(key: &str, info: Option<&Value>) -> Self {
        let Some(Value::Object(info)) = info else {
            return Self::basic(key);
        };
        let string = |name: &str| info.get(name).and_then(Value::as_str).map(str::to_string);
        let id = string("id");
        Self {
            path: string("path").filter(|p| !p.is_empty()).unwrap_or_else(|| key.to_string()),
            uuid: string("uuid").or_else(|| id.clone()),
            id,
            locked: info.get("locked").and_then(Value::as_bool),
            tainted: info.get("tainted").and_then(Value::as_bool),
            custom_metadata: match info.get("custom_metadata") {
                Some(Value::Object(map)) => Some(map.clone().into_iter().collect()),
                _ => None,
            },
        }
    }
}

/// List namespaces below the client's namespace, with details.
///
/// A 404 from the listing means no namespaces. When the listing carries
/// `key_info` it is used directly; otherwise each namespace is read
/// individually and any read that fails leaves that entry basic.
pub async fn list_namespaces(client: &ApiClient) -> Result<Vec<Namespace>, ApiError> {
    let listing = client.list_namespaces().await?;
    Ok(enrich(client, listing).await)
}

async fn enrich(client: &ApiClient, listing: ListResponse) -> Vec<Namespace> {
    if listing.keys.is_empty() {
        return Vec::new();
    }

    if let Some(key_info) = listing.key_info.as_ref().filter(|info| !info.is_empty()) {
        return listing
            .keys
            .iter()
            .map(|key| Namespace::from_key_info(key, key_info.get(key)))
            .collect();
    }

    stream::iter(listing.keys)
        .map(|key| async move {
            match client.read_namespace(&key).await {
                Ok(detail) => Namespace::from_detail(&key, detail),
                Err(e) => {
                    debug!(namespace = %key, error = %e, "Namespace detail unavailable");
                    Namespace::basic(&key)
                }
            }
        })
        .buffered(MAX_CONCURRENT_READS)
        .collect()
        .await
}

/// Case-insensitive substring match on the path. A blank query keeps all.
pub fn filter_namespaces<'a>(namespaces: &'a [Namespace], query: &str) -> Vec<&'a Namespace> {
    let query = query.trim().to_lowercase();
    namespaces
        .iter()
        .filter(|ns| query.is_empty() || ns.path.to_lowercase().contains(&query))
        .collect()
}

pub async fn create_namespace(
    client: &ApiClient,
    path: &str,
    custom_metadata: BTreeMap<String, String>,
) -> Result<(), ApiError> {
    client.write_namespace(path, custom_metadata).await
}

pub async fn delete_namespace(client: &ApiClient, path: &str) -> Result<(), ApiError> {
    client.delete_namespace(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ClientFactory, Method};
    use crate::testing::MockTransport;
    use serde_json::json;
    use std::sync::Arc;

    fn client(transport: &Arc<MockTransport>) -> ApiClient {
        ClientFactory::new("http://bao.test/v1", transport.clone()).create(Some("t1"), None)
    }

    #[tokio::test]
    async fn test_key_info_used_directly() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            Method::Get,
            "/sys/namespaces",
            200,
            json!({"data": {
                "keys": ["team-a/", "team-b/"],
                "key_info": {
                    "team-a/": {"id": "abc", "path": "team-a/", "locked": true, "custom_metadata": {"owner": "ops"}},
                    "team-b/": "garbage"
                }
            }}),
        );

        let namespaces = list_namespaces(&client(&transport)).await.unwrap();
        assert_eq!(namespaces.len(), 2);
        assert_eq!(namespaces[0].id.as_deref(), Some("abc"));
        assert_eq!(namespaces[0].uuid.as_deref(), Some("abc"));
        assert_eq!(namespaces[0].locked, Some(true));
        assert!(namespaces[0].custom_metadata.is_some());
        assert_eq!(namespaces[1], Namespace::basic("team-b/"));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_detail_failure_keeps_entries() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(Method::Get, "/sys/namespaces", 200, json!({"data": {"keys": ["a/", "b/"]}}));
        transport.respond(Method::Get, "/sys/namespaces/a", 200, json!({"data": {"id": "id-a", "path": "a/"}}));
        transport.respond(Method::Get, "/sys/namespaces/b", 500, json!({"errors": ["boom"]}));

        let namespaces = list_namespaces(&client(&transport)).await.unwrap();
        assert_eq!(namespaces.len(), 2);
        assert_eq!(namespaces[0].id.as_deref(), Some("id-a"));
        assert_eq!(namespaces[1], Namespace::basic("b/"));
    }

    #[tokio::test]
    async fn test_not_found_listing_is_empty() {
        let transport = Arc::new(MockTransport::new());
        let namespaces = list_namespaces(&client(&transport)).await.unwrap();
        assert!(namespaces.is_empty());
    }

    #[test]
    fn test_filter() {
        let all = vec![Namespace::basic("Team-A/"), Namespace::basic("ops/")];
        assert_eq!(filter_namespaces(&all, "  ").len(), 2);
        let hits = filter_namespaces(&all, "team");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name(), "Team-A");
    }
}
