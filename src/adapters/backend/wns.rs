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
use std::sync::Arc;

/// Windows Push Notification Services. The recipient is the channel URI itself.
#[derive(Debug, Clone, Default)]
pub struct WnsBackend;

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

impl WnsBackend {
    pub(crate) fn toast(notification: &Notification) -> String {
        let text = escape_xml(notification.payload.alert.as_deref().unwrap_or_default());
        format!(
            "<toast><visual><binding template=\"ToastGeneric\"><text>{text}</text></binding></visual></toast>"
        )
    }

    pub(crate) fn map_response(response: &BackendResponse) -> Result<()> {
        if response.is_success() {
            return Ok(());
        }
        let reason = response
            .header("x-wns-error-description")
            .map_or_else(|| format!("HTTP {}", response.status), str::to_string);
        let description = format!("WNS responded {} {reason}", response.status);
        match response.status {
            401 => Err(Error::CredentialExpired(description)),
            403 => Err(Error::CredentialRevoked(description)),
            404 => Err(Error::BackendRejected { code: "InvalidChannel".into(), description }),
            410 => Err(Error::BackendRejected { code: "ChannelExpired".into(), description }),
            406 => Err(Error::Transient { code: "Throttled".into(), description }),
            status => Err(classify_status(status, reason, description)),
        }
    }
}

#[async_trait]
impl Backend for WnsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wns
    }

    fn connection_kind(&self, _app: &App) -> ConnectionKind {
        ConnectionKind::Serial
    }

    async fn connect(&self, app: &App, options: &ConnectOptions) -> Result<Arc<dyn Transport>> {
        ensure_credential_valid(app)?;
        let base = app.endpoint.clone().unwrap_or_default();
        Ok(Arc::new(HttpTransport::connect(app, base, vec![bearer(app)?], options)?))
    }

    async fn send(
        &self,
        transport: &dyn Transport,
        _app: &App,
        notification: &Notification,
        recipient: &str,
    ) -> Result<SendReceipt> {
        let request = OutboundRequest {
            path: recipient.to_string(),
            headers: vec![
                ("content-type".to_string(), "text/xml".to_string()),
                ("x-wns-type".to_string(), "wns/toast".to_string()),
            ],
            body: Self::toast(notification).into_bytes(),
        };
        let response = transport.write(request).await?;
        Self::map_response(&response).map(|()| SendReceipt::default())
    }

    fn parse_feedback(&self, app: &App, recipient: &str, error: &Error) -> Option<FeedbackEvent> {
        match error {
            Error::BackendRejected { code, .. } if code == "InvalidChannel" || code == "ChannelExpired" => {
                Some(FeedbackEvent::new(app.id.clone(), recipient, FeedbackReason::InvalidToken))
            }
            _ => None,
        }
    }
}
