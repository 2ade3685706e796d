use crate::adapters::backend::http::{HttpTransport, bearer};
use crate::adapters::backend::{
    Backend, BackendResponse, ConnectOptions, ConnectionKind, OutboundRequest, SendReceipt, Transport,
    classify_status, ensure_credential_valid,
};
use crate::domain::app::{App, BackendKind};
use crate::domain::feedback::{FeedbackEvent, FeedbackReason};
use crate::domain::notification::{Notification, Priority};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;

const ENDPOINT: &str = "https://fcm.googleapis.com";

/// FCM HTTP v1. The app's `topic` is the Firebase project id and its api key an OAuth access token.
#[derive(Debug, Clone, Default)]
pub struct FcmBackend;

impl FcmBackend {
    /// FCM only accepts string values in `data`.
    fn stringify(data: &Map<String, Value>) -> Map<String, Value> {
        data.iter()
            .map(|(k, v)| {
                let s = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), Value::String(s))
            })
            .collect()
    }

    pub(crate) fn body(notification: &Notification, recipient: &str) -> Value {
        let payload = &notification.payload;
        let mut message = Map::new();
        message.insert("token".into(), json!(recipient));
        if let Some(alert) = &payload.alert {
            message.insert("notification".into(), json!({ "body": alert }));
        }
        if !payload.data.is_empty() {
            message.insert("data".into(), Value::Object(Self::stringify(&payload.data)));
        }

        let mut android = Map::new();
        android.insert(
            "priority".into(),
            json!(if payload.priority == Priority::High { "high" } else { "normal" }),
        );
        if let Some(collapse_key) = &payload.collapse_key {
            android.insert("collapse_key".into(), json!(collapse_key));
        }
        message.insert("android".into(), Value::Object(android));

        json!({ "message": message })
    }

    /// Legacy-format gateways answer with `results[0].registration_id` when the token was superseded.
    pub(crate) fn map_response(response: &BackendResponse, recipient: &str) -> Result<SendReceipt> {
        if response.is_success() {
            let reported = response.json_field(&["results", "0", "registration_id"]);
            return Ok(SendReceipt::canonical(recipient, reported));
        }
        let status = response.json_field(&["error", "status"]).unwrap_or_else(|| format!("HTTP {}", response.status));
        let message = response.json_field(&["error", "message"]).unwrap_or_default();
        let description = format!("FCM responded {} {status}: {message}", response.status);

        match (response.status, status.as_str()) {
            (401, _) => Err(Error::CredentialExpired(description)),
            (403, "THIRD_PARTY_AUTH_ERROR") => Err(Error::CredentialRevoked(description)),
            (_, "QUOTA_EXCEEDED" | "UNAVAILABLE" | "INTERNAL") => Err(Error::Transient { code: status, description }),
            (code, _) => Err(classify_status(code, status, description)),
        }
    }
}

#[async_trait]
impl Backend for FcmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fcm
    }

    fn connection_kind(&self, app: &App) -> ConnectionKind {
        ConnectionKind::Multiplexed { max_concurrent: app.connections }
    }

    async fn connect(&self, app: &App, options: &ConnectOptions) -> Result<Arc<dyn Transport>> {
        ensure_credential_valid(app)?;
        if app.topic.is_none() {
            return Err(Error::Configuration(format!("app {} is missing its FCM project id", app.id)));
        }
        let endpoint = app.endpoint.clone().unwrap_or_else(|| ENDPOINT.to_string());
        let transport = HttpTransport::connect(app, endpoint, vec![bearer(app)?], options)?;
        Ok(Arc::new(transport))
    }

    async fn send(
        &self,
        transport: &dyn Transport,
        app: &App,
        notification: &Notification,
        recipient: &str,
    ) -> Result<SendReceipt> {
        let project = app.topic.as_deref().unwrap_or_default();
        let request = OutboundRequest {
            path: format!("/v1/projects/{project}/messages:send"),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(&Self::body(notification, recipient)).map_err(|e| Error::BackendRejected {
                code: "PayloadEncoding".into(),
                description: e.to_string(),
            })?,
        };

        let response = transport.write(request).await?;
        Self::map_response(&response, recipient)
    }

    fn parse_feedback(&self, app: &App, recipient: &str, error: &Error) -> Option<FeedbackEvent> {
        let Error::BackendRejected { code, .. } = error else { return None };
        let reason = match code.as_str() {
            "UNREGISTERED" => FeedbackReason::Unregistered,
            "SENDER_ID_MISMATCH" => FeedbackReason::InvalidToken,
            _ => return None,
        };
        Some(FeedbackEvent::new(app.id.clone(), recipient, reason))
    }
}
