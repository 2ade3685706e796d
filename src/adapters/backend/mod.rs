use crate::domain::app::{App, BackendKind};
use crate::domain::feedback::FeedbackEvent;
use crate::domain::notification::Notification;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod adm;
pub mod apns;
pub mod fcm;
pub mod http;
pub mod wns;

pub use adm::AdmBackend;
pub use apns::ApnsBackend;
pub use fcm::FcmBackend;
pub use wns::WnsBackend;

/// How many sends a single connection can carry at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Serial,
    Multiplexed { max_concurrent: usize },
}

impl ConnectionKind {
    #[must_use]
    pub fn concurrency(self) -> usize {
        match self {
            Self::Serial => 1,
            Self::Multiplexed { max_concurrent } => max_concurrent.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct OutboundRequest {
    /// Appended to the transport's base URL, or used as-is when absolute.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct BackendResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl BackendResponse {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Reads a string field from a JSON body, following `path` through nested objects.
    /// Numeric keys index into arrays.
    #[must_use]
    pub fn json_field(&self, path: &[&str]) -> Option<String> {
        let root: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        let mut value = &root;
        for key in path {
            value = match (value, key.parse::<usize>()) {
                (serde_json::Value::Array(items), Ok(index)) => items.get(index)?,
                _ => value.get(*key)?,
            };
        }
        value.as_str().map(str::to_string)
    }
}

/// What a backend reported for an accepted send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
    /// Registration id the backend wants used instead of the one sent to.
    pub canonical_token: Option<String>,
}

impl SendReceipt {
    /// Keeps `reported` only when it names a different token than `recipient`.
    #[must_use]
    pub fn canonical(recipient: &str, reported: Option<String>) -> Self {
        Self { canonical_token: reported.filter(|token| !token.is_empty() && token != recipient) }
    }
}

/// A live, writable handle to a backend. Owned by the connection pool.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// Returns `Error::Connection` or `Error::Timeout` when the write did not reach the backend.
    async fn write(&self, request: OutboundRequest) -> Result<BackendResponse>;

    async fn close(&self);
}

/// One push provider protocol.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> BackendKind;

    fn connection_kind(&self, app: &App) -> ConnectionKind;

    /// Opens a transport authenticated with the app's current credential.
    ///
    /// # Errors
    /// Returns a credential error if the credential is unusable, or `Error::Connection`.
    async fn connect(&self, app: &App, options: &ConnectOptions) -> Result<Arc<dyn Transport>>;

    /// Serializes and writes one notification to one recipient, mapping the backend's answer.
    ///
    /// # Errors
    /// Returns a transient, rejection or credential error depending on the backend's response.
    async fn send(
        &self,
        transport: &dyn Transport,
        app: &App,
        notification: &Notification,
        recipient: &str,
    ) -> Result<SendReceipt>;

    /// Extracts token feedback from a rejection, if the rejection means the token is dead.
    fn parse_feedback(&self, app: &App, recipient: &str, error: &Error) -> Option<FeedbackEvent>;
}

/// Backends by kind. Apps pick theirs through `App::backend`.
#[derive(Debug, Clone, Default)]
pub struct Backends {
    by_kind: HashMap<BackendKind, Arc<dyn Backend>>,
}

impl Backends {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// APNs, FCM, ADM and WNS over HTTP.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with(Arc::new(ApnsBackend))
            .with(Arc::new(FcmBackend))
            .with(Arc::new(AdmBackend))
            .with(Arc::new(WnsBackend))
    }

    /// Registers `backend`, replacing any backend of the same kind.
    #[must_use]
    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.by_kind.insert(backend.kind(), backend);
        self
    }

    /// # Errors
    /// Returns `Error::Configuration` if no backend of this kind is registered.
    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn Backend>> {
        self.by_kind
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("no backend registered for {}", kind.as_str())))
    }
}

/// Fails fast on credentials that are already past their expiry.
pub(crate) fn ensure_credential_valid(app: &App) -> Result<()> {
    if app.credential.is_expired_at(time::OffsetDateTime::now_utc()) {
        return Err(Error::CredentialExpired(format!("credential for app {} has expired", app.id)));
    }
    Ok(())
}

/// Status handling shared by every HTTP backend. Backend-specific cases are matched first.
pub(crate) fn classify_status(status: u16, code: String, description: String) -> Error {
    match status {
        429 | 500..=599 => Error::Transient { code, description },
        _ => Error::BackendRejected { code, description },
    }
}
