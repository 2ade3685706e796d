use crate::adapters::backend::http::HttpTransport;
use crate::adapters::backend::{
    Backend, BackendResponse, ConnectOptions, ConnectionKind, OutboundRequest, SendReceipt, Transport,
    classify_status, ensure_credential_valid,
};
use crate::domain::app::{App, BackendKind, CredentialMaterial, Environment};
use crate::domain::feedback::{FeedbackEvent, FeedbackReason};
use crate::domain::notification::{Notification, Priority};
use crate::error::{Error, Result};
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;

const PRODUCTION_ENDPOINT: &str = "https://api.push.apple.com";
const SANDBOX_ENDPOINT: &str = "https://api.sandbox.push.apple.com";

#[derive(Debug, Serialize)]
struct ProviderClaims<'a> {
    iss: &'a str,
    iat: i64,
}

/// Token- or certificate-authenticated APNs over HTTP/2.
#[derive(Debug, Clone, Default)]
pub struct ApnsBackend;

impl ApnsBackend {
    fn endpoint(app: &App) -> String {
        app.endpoint.clone().unwrap_or_else(|| {
            match app.environment {
                Environment::Production => PRODUCTION_ENDPOINT,
                Environment::Sandbox => SANDBOX_ENDPOINT,
            }
            .to_string()
        })
    }

    /// Signs a provider token. Tokens are valid for an hour, so one is minted per connection
    /// and an `ExpiredProviderToken` answer forces a reconnect.
    fn provider_token(app: &App, key_id: &str, team_id: &str, pem: &str) -> Result<String> {
        let key = EncodingKey::from_ec_pem(pem.as_bytes())
            .map_err(|e| Error::CredentialRevoked(format!("invalid signing key for app {}: {e}", app.id)))?;
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(key_id.to_string());
        let claims = ProviderClaims { iss: team_id, iat: time::OffsetDateTime::now_utc().unix_timestamp() };
        jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| Error::CredentialRevoked(format!("failed to sign provider token for app {}: {e}", app.id)))
    }

    pub(crate) fn body(notification: &Notification) -> Value {
        let payload = &notification.payload;
        let mut aps = Map::new();
        if let Some(alert) = &payload.alert {
            aps.insert("alert".into(), json!(alert));
        }
        if let Some(badge) = payload.badge {
            aps.insert("badge".into(), json!(badge));
        }
        if let Some(sound) = &payload.sound {
            aps.insert("sound".into(), json!(sound));
        }
        if payload.content_available {
            aps.insert("content-available".into(), json!(1));
        }

        let mut body = payload.data.clone();
        body.insert("aps".into(), Value::Object(aps));
        Value::Object(body)
    }

    pub(crate) fn map_response(response: &BackendResponse) -> Result<()> {
        if response.is_success() {
            return Ok(());
        }
        let reason = response.json_field(&["reason"]).unwrap_or_else(|| format!("HTTP {}", response.status));
        let description = format!("APNs responded {} {reason}", response.status);

        match (response.status, reason.as_str()) {
            (403, "ExpiredProviderToken") => Err(Error::Connection(description)),
            (403, "BadCertificate" | "BadCertificateEnvironment" | "InvalidProviderToken") => {
                Err(Error::CredentialRevoked(description))
            }
            (status, _) => Err(classify_status(status, reason, description)),
        }
    }
}

#[async_trait]
impl Backend for ApnsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Apns
    }

    fn connection_kind(&self, app: &App) -> ConnectionKind {
        ConnectionKind::Multiplexed { max_concurrent: app.connections }
    }

    async fn connect(&self, app: &App, options: &ConnectOptions) -> Result<Arc<dyn Transport>> {
        ensure_credential_valid(app)?;

        let mut headers = Vec::new();
        if let Some(topic) = &app.topic {
            headers.push(("apns-topic".to_string(), topic.clone()));
        }
        match &app.credential.material {
            CredentialMaterial::SigningKey { key_id, team_id, pem } => {
                let token = Self::provider_token(app, key_id, team_id, pem)?;
                headers.push(("authorization".to_string(), format!("bearer {token}")));
            }
            CredentialMaterial::Certificate { .. } => {}
            CredentialMaterial::ApiKey { .. } => {
                return Err(Error::Configuration(format!(
                    "app {} needs a certificate or signing key for APNs",
                    app.id
                )));
            }
        }

        let transport = HttpTransport::connect(app, Self::endpoint(app), headers, options)?;
        Ok(Arc::new(transport))
    }

    async fn send(
        &self,
        transport: &dyn Transport,
        _app: &App,
        notification: &Notification,
        recipient: &str,
    ) -> Result<SendReceipt> {
        let payload = &notification.payload;
        let background = payload.alert.is_none() && payload.content_available;
        let priority = if background || payload.priority == Priority::Normal { "5" } else { "10" };

        let mut headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("apns-id".to_string(), notification.id.to_string()),
            ("apns-push-type".to_string(), if background { "background" } else { "alert" }.to_string()),
            ("apns-priority".to_string(), priority.to_string()),
        ];
        if let Some(collapse_key) = &payload.collapse_key {
            headers.push(("apns-collapse-id".to_string(), collapse_key.clone()));
        }

        let request = OutboundRequest {
            path: format!("/3/device/{recipient}"),
            headers,
            body: serde_json::to_vec(&Self::body(notification)).map_err(|e| Error::BackendRejected {
                code: "PayloadEncoding".into(),
                description: e.to_string(),
            })?,
        };

        let response = transport.write(request).await?;
        Self::map_response(&response).map(|()| SendReceipt::default())
    }

    fn parse_feedback(&self, app: &App, recipient: &str, error: &Error) -> Option<FeedbackEvent> {
        let Error::BackendRejected { code, .. } = error else { return None };
        let reason = match code.as_str() {
            "Unregistered" => FeedbackReason::Unregistered,
            "BadDeviceToken" | "DeviceTokenNotForTopic" => FeedbackReason::InvalidToken,
            _ => return None,
        };
        Some(FeedbackEvent::new(app.id.clone(), recipient, reason))
    }
}
