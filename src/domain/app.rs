use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AppId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Apns,
    Fcm,
    Adm,
    Wns,
}

impl BackendKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Apns => "apns",
            Self::Fcm => "fcm",
            Self::Adm => "adm",
            Self::Wns => "wns",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Sandbox,
    #[default]
    Production,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialMaterial {
    /// PEM bundle holding a client certificate and its private key.
    Certificate { pem: String },
    /// Token-signing key (APNs provider tokens).
    SigningKey { key_id: String, team_id: String, pem: String },
    /// Bearer secret or access token.
    ApiKey { secret: String },
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Certificate { .. } => f.write_str("Certificate(..)"),
            Self::SigningKey { key_id, team_id, .. } => {
                f.debug_struct("SigningKey").field("key_id", key_id).field("team_id", team_id).finish_non_exhaustive()
            }
            Self::ApiKey { .. } => f.write_str("ApiKey(..)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub material: CredentialMaterial,
    pub expires_at: Option<OffsetDateTime>,
}

impl Credential {
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        match &self.material {
            CredentialMaterial::Certificate { pem } => {
                hasher.update(b"certificate");
                hasher.update(pem.as_bytes());
            }
            CredentialMaterial::SigningKey { key_id, team_id, pem } => {
                hasher.update(b"signing_key");
                hasher.update(key_id.as_bytes());
                hasher.update(team_id.as_bytes());
                hasher.update(pem.as_bytes());
            }
            CredentialMaterial::ApiKey { secret } => {
                hasher.update(b"api_key");
                hasher.update(secret.as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }

    #[must_use]
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Per-app retry settings. Unset fields fall back to the global retry config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryOverrides {
    pub base_ms: Option<u64>,
    pub cap_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

const fn default_connections() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    pub name: String,
    pub backend: BackendKind,
    #[serde(default)]
    pub environment: Environment,
    pub credential: Credential,
    /// APNs bundle id or FCM project id.
    pub topic: Option<String>,
    /// Overrides the backend's default endpoint, mostly for tests and proxies.
    pub endpoint: Option<String>,
    #[serde(default)]
    pub retry: RetryOverrides,
    /// Concurrent in-flight sends allowed on one multiplexed connection.
    #[serde(default = "default_connections")]
    pub connections: usize,
}

impl App {
    #[must_use]
    pub fn new(id: impl Into<AppId>, backend: BackendKind, credential: Credential) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            backend,
            environment: Environment::Production,
            credential,
            topic: None,
            endpoint: None,
            retry: RetryOverrides::default(),
            connections: default_connections(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_key(secret: &str) -> Credential {
        Credential { material: CredentialMaterial::ApiKey { secret: secret.into() }, expires_at: None }
    }

    #[test]
    fn test_fingerprint_changes_on_rotation() {
        assert_eq!(api_key("one").fingerprint(), api_key("one").fingerprint());
        assert_ne!(api_key("one").fingerprint(), api_key("two").fingerprint());
    }

    #[test]
    fn test_debug_hides_secret_material() {
        let rendered = format!("{:?}", api_key("super-secret"));
        assert!(!rendered.contains("super-secret"));
    }

    #[test]
    fn test_app_manifest_defaults() {
        let app: App = serde_json::from_value(serde_json::json!({
            "id": "ios-consumer",
            "name": "Consumer",
            "backend": "apns",
            "credential": {
                "material": {"type": "signing_key", "key_id": "K", "team_id": "T", "pem": "---"},
                "expires_at": null
            },
            "topic": "com.example.consumer",
            "endpoint": null
        }))
        .expect("valid app json");

        assert_eq!(app.environment, Environment::Production);
        assert_eq!(app.connections, 1);
        assert_eq!(app.retry, RetryOverrides::default());
    }
}
