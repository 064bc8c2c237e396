//! API client for communicating with an OpenBao (Vault-compatible) server.
//!
//! [`ClientFactory`] is the only way to obtain an [`ApiClient`]. Every client
//! is bound to one (token, namespace) pair at construction and never changes
//! afterwards; switching identity or namespace means asking the factory for a
//! new client.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use super::transport::{ApiRequest, ApiResponse, Method, Transport};
use super::types::{
    AuthBlock, AuthEnvelope, DataEnvelope, EnabledAuthMethod, ListResponse, NamespaceDetail,
    SealStatus, TokenLookup,
};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// Header carrying the bearer credential.
pub const TOKEN_HEADER: &str = "X-Vault-Token";

/// Header scoping a request to a namespace. Absent means root.
pub const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// Builds immutable [`ApiClient`]s bound to one base URL and transport.
#[derive(Clone)]
pub struct ClientFactory {
    base_url: Arc<str>,
    transport: Arc<dyn Transport>,
    extra_headers: Arc<BTreeMap<String, String>>,
}

impl ClientFactory {
    pub fn new(base_url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: Arc::from(base_url.trim_end_matches('/')),
            transport,
            extra_headers: Arc::new(BTreeMap::new()),
        }
    }

    /// Headers sent on every request before token and namespace are applied.
    pub fn with_extra_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.extra_headers = Arc::new(headers);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Create a client for `token` scoped to `namespace`.
    ///
    /// `X-Vault-Token` is set only when a token is given. `X-Vault-Namespace`
    /// is omitted for `None`, `""` and `"/"`; any other value is sent exactly
    /// as given.
    pub fn create(&self, token: Option<&str>, namespace: Option<&str>) -> ApiClient {
        let mut headers: BTreeMap<String, String> = self
            .extra_headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case(TOKEN_HEADER) && !name.eq_ignore_ascii_case(NAMESPACE_HEADER)
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        if let Some(token) = token.filter(|t| !t.is_empty()) {
            headers.insert(TOKEN_HEADER.to_string(), token.to_string());
        }
        if let Some(ns) = namespace.filter(|ns| !ns.is_empty() && *ns != "/") {
            headers.insert(NAMESPACE_HEADER.to_string(), ns.to_string());
        }

        ApiClient {
            base_url: Arc::clone(&self.base_url),
            headers: Arc::new(headers),
            transport: Arc::clone(&self.transport),
        }
    }

    /// A client with neither token nor namespace, for `sys/seal-status` and logins.
    pub fn unauthenticated(&self) -> ApiClient {
        self.create(None, None)
    }
}

/// A configured front door to the API. No retries, no caching.
/// Clone is cheap and shares the header set.
#[derive(Clone)]
pub struct ApiClient {
    base_url: Arc<str>,
    headers: Arc<BTreeMap<String, String>>,
    transport: Arc<dyn Transport>,
}

impl ApiClient {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_token(&self) -> bool {
        self.header(TOKEN_HEADER).is_some()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.header(NAMESPACE_HEADER)
    }

    /// Send a raw request. Non-2xx statuses are returned, not raised.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<ApiResponse, ApiError> {
        let path = if path.starts_with('/') { path.to_string() } else { format!("/{}", path) };
        let request = ApiRequest {
            method,
            path,
            query: query.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            headers: (*self.headers).clone(),
            body,
        };
        debug!(method = %request.method, path = %request.path, "Sending API request");
        self.transport.send(&self.base_url, request).await
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<T, ApiError> {
        let response = self.request(method, path, query, body).await?;
        Self::check_response(response)?.json()
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(Method::Get, path, &[], None).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        self.send_json(Method::Post, path, &[], Some(body)).await
    }

    pub async fn put<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ApiError> {
        self.send_json(Method::Put, path, &[], Some(body)).await
    }

    /// POST and discard the response body (revoke, seal, deletes).
    pub async fn post_empty(&self, path: &str, body: Option<Value>) -> Result<(), ApiError> {
        let response = self.request(Method::Post, path, &[], body).await?;
        Self::check_response(response).map(|_| ())
    }

    /// LIST a path. A 404 is the server's way of saying "nothing here" and
    /// yields an empty listing.
    pub async fn list(&self, path: &str) -> Result<ListResponse, ApiError> {
        match self
            .send_json::<DataEnvelope<ListResponse>>(Method::Get, path, &[("list", "true")], None)
            .await
        {
            Ok(envelope) => Ok(envelope.data.unwrap_or_default()),
            Err(ApiError::NotFound(_)) => {
                debug!(path, "List returned 404, treating as empty");
                Ok(ListResponse::default())
            }
            Err(e) => Err(e),
        }
    }

    // ===== Token endpoints =====

    pub async fn lookup_self(&self) -> Result<TokenLookup, ApiError> {
        let envelope: DataEnvelope<TokenLookup> = self.get("/auth/token/lookup-self").await?;
        envelope
            .data
            .ok_or_else(|| ApiError::InvalidResponse("lookup-self returned no data".to_string()))
    }

    pub async fn renew_self(&self) -> Result<AuthBlock, ApiError> {
        let envelope: AuthEnvelope = self.post("/auth/token/renew-self", json!({})).await?;
        envelope
            .auth
            .ok_or_else(|| ApiError::InvalidResponse("renew-self returned no auth block".to_string()))
    }

    pub async fn revoke_self(&self) -> Result<(), ApiError> {
        self.post_empty("/auth/token/revoke-self", None).await
    }

    /// POST to `/auth/{mount}/login[/{username}]`.
    pub async fn login(
        &self,
        mount: &str,
        username: Option<&str>,
        body: Value,
    ) -> Result<AuthBlock, ApiError> {
        let mount = encode_path(mount);
        let path = match username {
            Some(user) => format!("/auth/{}/login/{}", mount, urlencoding::encode(user)),
            None => format!("/auth/{}/login", mount),
        };
        let envelope: AuthEnvelope = self.post(&path, body).await?;
        envelope
            .auth
            .ok_or_else(|| ApiError::InvalidResponse("login returned no auth block".to_string()))
    }

    // ===== System endpoints =====

    pub async fn seal_status(&self) -> Result<SealStatus, ApiError> {
        self.get("/sys/seal-status").await
    }

    /// Submit one unseal key share. The answer carries the new progress.
    pub async fn unseal(&self, key: &str) -> Result<SealStatus, ApiError> {
        self.put("/sys/unseal", json!({ "key": key })).await
    }

    /// Discard the key shares submitted so far.
    pub async fn unseal_reset(&self) -> Result<SealStatus, ApiError> {
        self.put("/sys/unseal", json!({ "reset": true })).await
    }

    /// Seal the server. Needs a token with `sudo` on `sys/seal`.
    pub async fn seal(&self) -> Result<(), ApiError> {
        let response = self.request(Method::Put, "/sys/seal", &[], None).await?;
        Self::check_response(response).map(|_| ())
    }

    pub async fn list_auth_methods(&self) -> Result<Vec<EnabledAuthMethod>, ApiError> {
        let raw: Value = self.get("/sys/auth").await?;
        Ok(EnabledAuthMethod::from_mount_table(&raw))
    }

    // ===== Namespaces =====

    pub async fn list_namespaces(&self) -> Result<ListResponse, ApiError> {
        self.list("/sys/namespaces").await
    }

    pub async fn read_namespace(&self, path: &str) -> Result<NamespaceDetail, ApiError> {
        let envelope: DataEnvelope<NamespaceDetail> =
            self.get(&format!("/sys/namespaces/{}", encode_path(path))).await?;
        envelope
            .data
            .ok_or_else(|| ApiError::InvalidResponse(format!("namespace {} returned no data", path)))
    }

    pub async fn write_namespace(
        &self,
        path: &str,
        custom_metadata: BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        let body = json!({ "custom_metadata": custom_metadata });
        self.post_empty(&format!("/sys/namespaces/{}", encode_path(path)), Some(body))
            .await
    }

    pub async fn delete_namespace(&self, path: &str) -> Result<(), ApiError> {
        let response = self
            .request(Method::Delete, &format!("/sys/namespaces/{}", encode_path(path)), &[], None)
            .await?;
        Self::check_response(response).map(|_| ())
    }
}

/// Percent-encode each segment of a slash-separated path, dropping empty
/// segments. The separators themselves stay literal.
fn encode_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

// ============================================================================
// Tests
// ============================================================================
