//! Wire types for the endpoints the console consumes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The `auth` block returned by login and renew-self.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthBlock {
    #[serde(default)]
    pub client_token: String,
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AuthEnvelope {
    #[serde(default)]
    pub auth: Option<AuthBlock>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct DataEnvelope<T> {
    pub data: Option<T>,
}

/// `data` of `GET /auth/token/lookup-self`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TokenLookup {
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub meta: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub expire_time: Option<String>,
}

/// `GET /sys/seal-status`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SealStatus {
    pub sealed: bool,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub t: u32,
    #[serde(default)]
    pub n: u32,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub cluster_name: Option<String>,
}

/// One entry of `GET /sys/auth`, keyed by mount path (e.g. `userpass/`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledAuthMethod {
    pub path: String,
    #[serde(rename = "type")]
    pub method_type: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl EnabledAuthMethod {
    pub fn new(path: &str, method_type: &str, description: Option<&str>) -> Self {
        Self {
            path: path.to_string(),
            method_type: method_type.to_string(),
            description: description.map(str::to_string),
        }
    }

    /// Read the mount table. Servers return it both at the top level and
    /// under `data`; the `data` copy wins when present.
    pub(crate) fn from_mount_table(raw: &Value) -> Vec<Self> {
        let table = match raw.get("data") {
            Some(Value::Object(data)) => data,
            _ => match raw {
                Value::Object(top) => top,
                _ => return Vec::new(),
            },
        };

        let mut methods: Vec<Self> = table
            .iter()
            .filter_map(|(path, info)| {
                let method_type = info.get("type")?.as_str()?;
                let description = info
                    .get("description")
                    .and_then(Value::as_str)
                    .filter(|d| !d.is_empty());
                Some(Self::new(path, method_type, description))
            })
            .collect();
        methods.sort_by(|a, b| a.path.cmp(&b.path));
        methods
    }
}

/// `data` of a LIST request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ListResponse {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub key_info: Option<BTreeMap<String, Value>>,
}

/// `data` of `GET /sys/namespaces/{path}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NamespaceDetail {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub locked: Option<bool>,
    #[serde(default)]
    pub tainted: Option<bool>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub custom_metadata: Option<BTreeMap<String, Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mount_table_prefers_data() {
        let raw = json!({
            "token/": {"type": "token", "description": "token based credentials"},
            "request_id": "abc",
            "data": {
                "userpass/": {"type": "userpass", "description": ""},
                "token/": {"type": "token"}
            }
        });
        let methods = EnabledAuthMethod::from_mount_table(&raw);
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[0].path, "token/");
        assert_eq!(methods[1].method_type, "userpass");
        assert_eq!(methods[1].description, None);
    }

    #[test]
    fn test_mount_table_top_level_skips_non_mounts() {
        let raw = json!({
            "ldap/": {"type": "ldap"},
            "lease_id": "",
            "renewable": false
        });
        let methods = EnabledAuthMethod::from_mount_table(&raw);
        assert_eq!(methods, vec![EnabledAuthMethod::new("ldap/", "ldap", None)]);
    }

    #[test]
    fn test_auth_block_defaults() {
        let auth: AuthBlock = serde_json::from_value(json!({"client_token": "t1"})).unwrap();
        assert_eq!(auth.client_token, "t1");
        assert_eq!(auth.lease_duration, 0);
        assert!(!auth.renewable);
        assert!(auth.policies.is_empty());
    }
}
