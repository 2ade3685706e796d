use crate::adapters::backend::http::{HttpTransport, bearer};
use crate::adapters::backend::{
    Backend, BackendResponse, ConnectOptions, ConnectionKind, OutboundRequest, SendReceipt, Transport,
    classify_status, ensure_credential_valid,
};
use crate::domain::app::{App, BackendKind};
use crate::domain::feedback::{FeedbackEvent, FeedbackReason};
use crate::domain::notification::Notification;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;

const ENDPOINT: &str = "https://api.amazon.com";
const REGISTRATION_ID_HEADER: &str = "x-amzn-registrationid";

/// Amazon Device Messaging. One request per registration id, sent serially.
#[derive(Debug, Clone, Default)]
pub struct AdmBackend;

impl AdmBackend {
    pub(crate) fn body(notification: &Notification) -> Value {
        let payload = &notification.payload;
        let mut data: Map<String, Value> = payload
            .data
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.as_str().map_or_else(|| v.to_string(), str::to_string))))
            .collect();
        if let Some(alert) = &payload.alert {
            data.insert("message".into(), json!(alert));
        }

        let mut body = Map::new();
        body.insert("data".into(), Value::Object(data));
        if let Some(collapse_key) = &payload.collapse_key {
            body.insert("consolidationKey".into(), json!(collapse_key));
        }
        Value::Object(body)
    }

    /// A successful answer echoes the registration id ADM wants used; a different one replaces the recipient.
    pub(crate) fn map_response(response: &BackendResponse, recipient: &str) -> Result<SendReceipt> {
        if response.is_success() {
            let reported = response.header(REGISTRATION_ID_HEADER).map(str::to_string);
            return Ok(SendReceipt::canonical(recipient, reported));
        }
        let reason = response.json_field(&["reason"]).unwrap_or_else(|| format!("HTTP {}", response.status));
        let description = format!("ADM responded {} {reason}", response.status);
        match response.status {
            401 => Err(Error::CredentialExpired(description)),
            status => Err(classify_status(status, reason, description)),
        }
    }
}

#[async_trait]
impl Backend for AdmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Adm
    }

    fn connection_kind(&self, _app: &App) -> ConnectionKind {
        ConnectionKind::Serial
    }

    async fn connect(&self, app: &App, options: &ConnectOptions) -> Result<Arc<dyn Transport>> {
        ensure_credential_valid(app)?;
        let endpoint = app.endpoint.clone().unwrap_or_else(|| ENDPOINT.to_string());
        let headers = vec![
            bearer(app)?,
            ("x-amzn-type-version".to_string(), "com.amazon.device.messaging.ADMMessage@1.0".to_string()),
            ("accept".to_string(), "application/json".to_string()),
        ];
        Ok(Arc::new(HttpTransport::connect(app, endpoint, headers, options)?))
    }

    async fn send(
        &self,
        transport: &dyn Transport,
        _app: &App,
        notification: &Notification,
        recipient: &str,
    ) -> Result<SendReceipt> {
        let request = OutboundRequest {
            path: format!("/messaging/registrations/{recipient}/messages"),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(&Self::body(notification)).map_err(|e| Error::BackendRejected {
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
            "Unregistered" => FeedbackReason::Unregistered,
            "InvalidRegistrationId" => FeedbackReason::InvalidToken,
            _ => return None,
        };
        Some(FeedbackEvent::new(app.id.clone(), recipient, reason))
    }
}
