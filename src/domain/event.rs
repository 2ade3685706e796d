use crate::domain::app::AppId;
use crate::domain::feedback::FeedbackReason;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NotificationEnqueued,
    NotificationDelivered,
    NotificationPartiallyDelivered,
    NotificationFailed,
    NotificationWillRetry,
    DeliveredToRecipient,
    FailedToRecipient,
    TcpConnectionLost,
    Feedback,
    CanonicalId,
    CertificateWillExpire,
    CertificateRevoked,
    Error,
}

impl EventKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotificationEnqueued => "notification_enqueued",
            Self::NotificationDelivered => "notification_delivered",
            Self::NotificationPartiallyDelivered => "notification_partially_delivered",
            Self::NotificationFailed => "notification_failed",
            Self::NotificationWillRetry => "notification_will_retry",
            Self::DeliveredToRecipient => "delivered_to_recipient",
            Self::FailedToRecipient => "failed_to_recipient",
            Self::TcpConnectionLost => "tcp_connection_lost",
            Self::Feedback => "feedback",
            Self::CanonicalId => "canonical_id",
            Self::CertificateWillExpire => "ssl_certificate_will_expire",
            Self::CertificateRevoked => "ssl_certificate_revoked",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub notification_id: Uuid,
    pub app_id: AppId,
    pub device_tokens: Vec<String>,
    pub payload_summary: String,
}

/// A fan-out where some recipients accepted and the rest failed permanently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartiallyDelivered {
    pub notification_id: Uuid,
    pub app_id: AppId,
    pub delivered_to: Vec<String>,
    pub failed_to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failed {
    pub notification_id: Uuid,
    pub app_id: AppId,
    pub error_code: String,
    pub error_description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillRetry {
    pub notification_id: Uuid,
    pub app_id: AppId,
    pub next_attempt: OffsetDateTime,
    pub retries: u32,
}

/// Everything the engine publishes on the reflection bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflectionEvent {
    NotificationEnqueued { notification_id: Uuid, app_id: AppId, queue_size: usize },
    NotificationDelivered(Delivered),
    NotificationPartiallyDelivered(PartiallyDelivered),
    NotificationFailed(Failed),
    NotificationWillRetry(WillRetry),
    DeliveredToRecipient { notification_id: Uuid, token: String },
    FailedToRecipient { notification_id: Uuid, token: String, error_code: String, error_description: String },
    TcpConnectionLost { app_id: AppId, error: String },
    Feedback { app_id: AppId, device_token: String, reason: FeedbackReason },
    /// The backend accepted the send but wants `new_token` used instead of `old_token`.
    CanonicalId { app_id: AppId, old_token: String, new_token: String },
    CertificateWillExpire { app_id: AppId, expires_at: OffsetDateTime },
    CertificateRevoked { app_id: AppId, error: String },
    Error { app_id: Option<AppId>, error: crate::error::Error },
}

impl ReflectionEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::NotificationEnqueued { .. } => EventKind::NotificationEnqueued,
            Self::NotificationDelivered(_) => EventKind::NotificationDelivered,
            Self::NotificationPartiallyDelivered(_) => EventKind::NotificationPartiallyDelivered,
            Self::NotificationFailed(_) => EventKind::NotificationFailed,
            Self::NotificationWillRetry(_) => EventKind::NotificationWillRetry,
            Self::DeliveredToRecipient { .. } => EventKind::DeliveredToRecipient,
            Self::FailedToRecipient { .. } => EventKind::FailedToRecipient,
            Self::TcpConnectionLost { .. } => EventKind::TcpConnectionLost,
            Self::Feedback { .. } => EventKind::Feedback,
            Self::CanonicalId { .. } => EventKind::CanonicalId,
            Self::CertificateWillExpire { .. } => EventKind::CertificateWillExpire,
            Self::CertificateRevoked { .. } => EventKind::CertificateRevoked,
            Self::Error { .. } => EventKind::Error,
        }
    }
}
