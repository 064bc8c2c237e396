//! Login methods the console knows about, and discovery of the ones the
//! server has enabled.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{ApiClient, EnabledAuthMethod};

/// An auth backend type as reported in the `type` column of `sys/auth`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AuthMethod {
    Token,
    Userpass,
    Ldap,
    Approle,
    Jwt,
    Oidc,
    Github,
    Other(String),
}

/// Types offered on the login form, in display order.
pub const LOGIN_METHODS: [AuthMethod; 6] = [
    AuthMethod::Token,
    AuthMethod::Userpass,
    AuthMethod::Ldap,
    AuthMethod::Jwt,
    AuthMethod::Oidc,
    AuthMethod::Approle,
];

/// A credential input the login form renders for a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthField {
    pub name: &'static str,
    pub label: &'static str,
    pub secret: bool,
}

const TOKEN_FIELDS: &[AuthField] = &[AuthField { name: "token", label: "Token", secret: true }];
const USER_FIELDS: &[AuthField] = &[
    AuthField { name: "username", label: "Username", secret: false },
    AuthField { name: "password", label: "Password", secret: true },
];
const JWT_FIELDS: &[AuthField] = &[
    AuthField { name: "role", label: "Role", secret: false },
    AuthField { name: "jwt", label: "JWT", secret: true },
];
const APPROLE_FIELDS: &[AuthField] = &[
    AuthField { name: "role_id", label: "Role ID", secret: false },
    AuthField { name: "secret_id", label: "Secret ID", secret: true },
];

impl AuthMethod {
    pub fn as_str(&self) -> &str {
        match self {
            AuthMethod::Token => "token",
            AuthMethod::Userpass => "userpass",
            AuthMethod::Ldap => "ldap",
            AuthMethod::Approle => "approle",
            AuthMethod::Jwt => "jwt",
            AuthMethod::Oidc => "oidc",
            AuthMethod::Github => "github",
            AuthMethod::Other(other) => other,
        }
    }

    /// Methods that complete in a browser redirect rather than a form post.
    pub fn is_external(&self) -> bool {
        matches!(self, AuthMethod::Oidc | AuthMethod::Github)
    }

    pub fn is_login_method(&self) -> bool {
        LOGIN_METHODS.contains(self)
    }

    /// Mount path used when the request names none.
    pub fn default_mount(&self) -> &str {
        self.as_str()
    }

    pub fn label(&self) -> &str {
        match self {
            AuthMethod::Token => "Token",
            AuthMethod::Userpass => "Username",
            AuthMethod::Ldap => "LDAP",
            AuthMethod::Approle => "AppRole",
            AuthMethod::Jwt => "JWT",
            AuthMethod::Oidc => "OIDC",
            AuthMethod::Github => "GitHub",
            AuthMethod::Other(other) => other,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AuthMethod::Token => "Token authentication.",
            AuthMethod::Userpass => "A simple username and password backend.",
            AuthMethod::Ldap => "LDAP authentication.",
            AuthMethod::Approle => "Machine authentication with a role ID and secret ID.",
            AuthMethod::Jwt | AuthMethod::Oidc => "Authenticate using JWT or OIDC provider.",
            AuthMethod::Github => "Authenticate with a GitHub personal access token.",
            AuthMethod::Other(_) => "",
        }
    }

    /// Inputs the login form collects. External methods collect nothing.
    pub fn fields(&self) -> &'static [AuthField] {
        match self {
            AuthMethod::Token => TOKEN_FIELDS,
            AuthMethod::Userpass | AuthMethod::Ldap => USER_FIELDS,
            AuthMethod::Jwt => JWT_FIELDS,
            AuthMethod::Approle => APPROLE_FIELDS,
            _ => &[],
        }
    }
}

impl From<&str> for AuthMethod {
    fn from(value: &str) -> Self {
        match value.trim().trim_end_matches('/').to_ascii_lowercase().as_str() {
            "token" => AuthMethod::Token,
            "userpass" => AuthMethod::Userpass,
            "ldap" => AuthMethod::Ldap,
            "approle" => AuthMethod::Approle,
            "jwt" => AuthMethod::Jwt,
            "oidc" => AuthMethod::Oidc,
            "github" => AuthMethod::Github,
            other => AuthMethod::Other(other.to_string()),
        }
    }
}

impl From<String> for AuthMethod {
    fn from(value: String) -> Self {
        AuthMethod::from(value.as_str())
    }
}

impl From<AuthMethod> for String {
    fn from(method: AuthMethod) -> Self {
        method.as_str().to_string()
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Pending request
// ============================================================================

/// The credentials gathered by a login form. Lives only for one login call.
#[derive(Clone)]
pub struct PendingAuthRequest {
    pub method: AuthMethod,
    pub credentials: BTreeMap<String, String>,
    pub namespace: Option<String>,
    pub mount_path: Option<String>,
}

impl PendingAuthRequest {
    pub fn new(method: AuthMethod) -> Self {
        Self {
            method,
            credentials: BTreeMap::new(),
            namespace: None,
            mount_path: None,
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self::new(AuthMethod::Token).credential("token", token)
    }

    pub fn userpass(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::new(AuthMethod::Userpass)
            .credential("username", username)
            .credential("password", password)
    }

    pub fn credential(mut self, name: &str, value: impl Into<String>) -> Self {
        self.credentials.insert(name.to_string(), value.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn mount_path(mut self, mount: impl Into<String>) -> Self {
        self.mount_path = Some(mount.into());
        self
    }

    /// Mount to post to: the explicit path, or the method's default.
    pub fn mount(&self) -> String {
        self.mount_path
            .as_deref()
            .map(|m| m.trim_matches('/'))
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.method.default_mount())
            .to_string()
    }

    /// First non-empty value among `names`.
    pub fn get(&self, names: &[&str]) -> Option<&str> {
        names
            .iter()
            .filter_map(|name| self.credentials.get(*name))
            .map(|v| v.as_str())
            .find(|v| !v.is_empty())
    }
}

// Credential values are secrets; only their names are printed.
impl fmt::Debug for PendingAuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAuthRequest")
            .field("method", &self.method)
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .field("namespace", &self.namespace)
            .field("mount_path", &self.mount_path)
            .finish()
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// One selectable entry of the login method picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct LoginOption {
    /// `type:path`, unique per mount.
    pub value: String,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub method: AuthMethod,
    pub path: String,
    pub label: String,
    pub description: String,
}

impl LoginOption {
    fn from_enabled(enabled: &EnabledAuthMethod) -> Self {
        let method = AuthMethod::from(enabled.method_type.as_str());
        Self {
            value: format_method_value(method.as_str(), &enabled.path),
            label: method.label().to_string(),
            description: enabled
                .description
                .clone()
                .unwrap_or_else(|| method.description().to_string()),
            path: enabled.path.clone(),
            method,
        }
    }

    /// A login request prefilled with this option's method and mount.
    pub fn request(&self) -> PendingAuthRequest {
        PendingAuthRequest::new(self.method.clone()).mount_path(self.path.clone())
    }
}

pub fn format_method_value(method_type: &str, path: &str) -> String {
    format!("{}:{}", method_type, path)
}

/// Split a `type:path` picker value. Both halves must be non-empty.
pub fn parse_method_value(value: &str) -> Option<(AuthMethod, String)> {
    let (method_type, path) = value.split_once(':')?;
    if method_type.is_empty() || path.is_empty() {
        return None;
    }
    Some((AuthMethod::from(method_type), path.to_string()))
}

/// Offered when the mount table cannot be read.
pub fn fallback_methods() -> Vec<EnabledAuthMethod> {
    [AuthMethod::Userpass, AuthMethod::Token, AuthMethod::Ldap]
        .iter()
        .map(|m| EnabledAuthMethod::new(&format!("{}/", m.as_str()), m.as_str(), Some(m.description())))
        .collect()
}

/// Build picker options from a mount table, keeping only login methods.
pub fn login_options(enabled: &[EnabledAuthMethod]) -> Vec<LoginOption> {
    enabled
        .iter()
        .map(LoginOption::from_enabled)
        .filter(|option| option.method.is_login_method())
        .collect()
}

/// Read `sys/auth` and turn it into picker options. Any failure falls back
/// to the static userpass/token/ldap list.
pub async fn discover_methods(client: &ApiClient) -> Vec<LoginOption> {
    let enabled = match client.list_auth_methods().await {
        Ok(enabled) => {
            debug!(count = enabled.len(), "Loaded enabled auth methods");
            enabled
        }
        Err(e) => {
            warn!(error = %e, "Failed to load auth methods, using defaults");
            fallback_methods()
        }
    };
    login_options(&enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ClientFactory, Method};
    use crate::testing::MockTransport;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_method_parsing() {
        assert_eq!(AuthMethod::from("userpass/"), AuthMethod::Userpass);
        assert_eq!(AuthMethod::from("OIDC"), AuthMethod::Oidc);
        assert_eq!(AuthMethod::from("kubernetes"), AuthMethod::Other("kubernetes".to_string()));
        assert!(AuthMethod::Github.is_external());
        assert!(!AuthMethod::Jwt.is_external());
        assert!(AuthMethod::Oidc.fields().is_empty());
    }

    #[test]
    fn test_method_value_format() {
        assert_eq!(format_method_value("ldap", "corp-ldap/"), "ldap:corp-ldap/");
        assert_eq!(
            parse_method_value("ldap:corp-ldap/"),
            Some((AuthMethod::Ldap, "corp-ldap/".to_string()))
        );
        assert_eq!(parse_method_value("ldap:"), None);
        assert_eq!(parse_method_value("ldap"), None);
    }

    #[test]
    fn test_request_mount_defaults_to_type() {
        let req = PendingAuthRequest::userpass("alice", "pw");
        assert_eq!(req.mount(), "userpass");
        let req = req.mount_path("/corp-users/");
        assert_eq!(req.mount(), "corp-users");
    }

    #[test]
    fn test_request_debug_hides_values() {
        let req = PendingAuthRequest::userpass("alice", "hunter2");
        let rendered = format!("{:?}", req);
        assert!(rendered.contains("password"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_login_options_filter_unsupported() {
        let enabled = vec![
            EnabledAuthMethod::new("kubernetes/", "kubernetes", None),
            EnabledAuthMethod::new("userpass/", "userpass", Some("people")),
            EnabledAuthMethod::new("token/", "token", None),
        ];
        let options = login_options(&enabled);
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].value, "userpass:userpass/");
        assert_eq!(options[0].description, "people");
        assert_eq!(options[1].description, AuthMethod::Token.description());
    }

    #[tokio::test]
    async fn test_discovery_falls_back_on_error() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(Method::Get, "/sys/auth", 500, json!({"errors": ["boom"]}));
        let factory = ClientFactory::new("http://bao.test/v1", transport);

        let options = discover_methods(&factory.unauthenticated()).await;
        let values: Vec<_> = options.iter().map(|o| o.value.as_str()).collect();
        assert_eq!(values, vec!["userpass:userpass/", "token:token/", "ldap:ldap/"]);
    }

    #[tokio::test]
    async fn test_discovery_reads_mount_table() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(
            Method::Get,
            "/sys/auth",
            200,
            json!({"data": {"approle/": {"type": "approle"}, "oidc/": {"type": "oidc"}}}),
        );
        let factory = ClientFactory::new("http://bao.test/v1", transport);

        let options = discover_methods(&factory.unauthenticated()).await;
        assert_eq!(options.len(), 2);
        assert_eq!(options[0].method, AuthMethod::Approle);
        assert!(options[1].method.is_external());
    }
}
