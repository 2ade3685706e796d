use crate::domain::app::AppId;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackReason {
    /// The device uninstalled the app or the token was rotated.
    Unregistered,
    InvalidToken,
    /// The app's credential was revoked. Carries the backend's description.
    CertificateRevoked(String),
    Other(String),
}

impl fmt::Display for FeedbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unregistered => f.write_str("unregistered"),
            Self::InvalidToken => f.write_str("invalid_token"),
            Self::CertificateRevoked(_) => f.write_str("certificate_revoked"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// Out-of-band signal from a backend. Consumed once by the feedback worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackEvent {
    pub app_id: AppId,
    pub device_token: String,
    pub reason: FeedbackReason,
    pub timestamp: OffsetDateTime,
}

impl FeedbackEvent {
    #[must_use]
    pub fn new(app_id: AppId, device_token: impl Into<String>, reason: FeedbackReason) -> Self {
        Self { app_id, device_token: device_token.into(), reason, timestamp: OffsetDateTime::now_utc() }
    }
}
