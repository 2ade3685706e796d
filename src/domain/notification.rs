use crate::domain::app::AppId;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationState {
    Pending,
    /// Claimed by a poller and queued on an app runner.
    Enqueued,
    Sending,
    Delivered,
    Failed,
    Retrying,
    /// Some recipients accepted the notification and the rest failed permanently.
    PartiallyDelivered,
}

impl NotificationState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::PartiallyDelivered)
    }

    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Enqueued | Self::Sending)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    High,
    Normal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub alert: Option<String>,
    pub badge: Option<u32>,
    pub sound: Option<String>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    pub collapse_key: Option<String>,
    #[serde(default)]
    pub content_available: bool,
    #[serde(default)]
    pub priority: Priority,
}

impl Payload {
    #[must_use]
    pub fn alert(text: impl Into<String>) -> Self {
        Self { alert: Some(text.into()), ..Self::default() }
    }

    /// One-line description used in logs and delivery events.
    #[must_use]
    pub fn summary(&self) -> String {
        match (&self.alert, self.data.is_empty()) {
            (Some(alert), _) => alert.clone(),
            (None, false) => format!("data({} keys)", self.data.len()),
            (None, true) => "<empty>".to_string(),
        }
    }
}

/// Error code and description recorded on a failed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub code: String,
    pub description: String,
}

impl DeliveryFailure {
    #[must_use]
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self { code: code.into(), description: description.into() }
    }
}

impl From<&crate::error::Error> for DeliveryFailure {
    fn from(e: &crate::error::Error) -> Self {
        Self { code: e.code(), description: e.description() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientFailure {
    pub token: String,
    pub code: String,
    pub description: String,
}

/// Which recipients have reached an outcome. Recipients in neither list are still pending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryProgress {
    pub delivered_to: Vec<String>,
    pub failed_to: Vec<RecipientFailure>,
}

impl DeliveryProgress {
    #[must_use]
    pub fn is_settled(&self, token: &str) -> bool {
        self.delivered_to.iter().any(|t| t == token) || self.failed_to.iter().any(|f| f.token == token)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub app_id: AppId,
    pub recipients: Vec<String>,
    pub payload: Payload,
    pub state: NotificationState,
    pub retries: u32,
    pub deliver_after: Option<OffsetDateTime>,
    pub error_code: Option<String>,
    pub error_description: Option<String>,
    #[serde(default)]
    pub progress: DeliveryProgress,
    pub created_at: OffsetDateTime,
    pub delivered_at: Option<OffsetDateTime>,
    pub failed_at: Option<OffsetDateTime>,
}

impl Notification {
    #[must_use]
    pub fn new(app_id: AppId, device_token: impl Into<String>, payload: Payload) -> Self {
        Self::with_recipients(app_id, vec![device_token.into()], payload)
    }

    #[must_use]
    pub fn with_recipients(app_id: AppId, recipients: Vec<String>, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            app_id,
            recipients,
            payload,
            state: NotificationState::Pending,
            retries: 0,
            deliver_after: None,
            error_code: None,
            error_description: None,
            progress: DeliveryProgress::default(),
            created_at: OffsetDateTime::now_utc(),
            delivered_at: None,
            failed_at: None,
        }
    }

    /// The first recipient. Single-device notifications only have this one.
    #[must_use]
    pub fn device_token(&self) -> &str {
        self.recipients.first().map_or("", String::as_str)
    }

    #[must_use]
    pub fn pending_recipients(&self) -> Vec<&str> {
        self.recipients.iter().map(String::as_str).filter(|t| !self.progress.is_settled(t)).collect()
    }

    /// Whether a pending or retrying notification may be claimed at `now`.
    #[must_use]
    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        matches!(self.state, NotificationState::Pending | NotificationState::Retrying)
            && self.deliver_after.is_none_or(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_pending_recipients_skip_settled_tokens() {
        let mut n = Notification::with_recipients(
            AppId::from("app"),
            vec!["a".into(), "b".into(), "c".into()],
            Payload::alert("hi"),
        );
        n.progress.delivered_to.push("a".into());
        n.progress.failed_to.push(RecipientFailure {
            token: "c".into(),
            code: "InvalidToken".into(),
            description: String::new(),
        });

        assert_eq!(n.pending_recipients(), vec!["b"]);
        assert_eq!(n.device_token(), "a");
    }

    #[test]
    fn test_is_due_respects_deliver_after() {
        let now = OffsetDateTime::now_utc();
        let mut n = Notification::new(AppId::from("app"), "tok", Payload::default());
        assert!(n.is_due(now));

        n.state = NotificationState::Retrying;
        n.deliver_after = Some(now + Duration::seconds(10));
        assert!(!n.is_due(now));
        assert!(n.is_due(now + Duration::seconds(11)));

        n.state = NotificationState::Enqueued;
        assert!(!n.is_due(now + Duration::seconds(11)));
    }

    #[test]
    fn test_partially_delivered_is_terminal_and_never_due() {
        let mut n = Notification::new(AppId::from("app"), "tok", Payload::default());
        n.state = NotificationState::PartiallyDelivered;
        assert!(n.state.is_terminal());
        assert!(!n.state.is_in_flight());
        assert!(!n.is_due(OffsetDateTime::now_utc()));
        assert_eq!(serde_json::to_value(n.state).unwrap(), "partially_delivered");
    }

    #[test]
    fn test_payload_summary() {
        assert_eq!(Payload::alert("Hello").summary(), "Hello");
        let mut p = Payload::default();
        assert_eq!(p.summary(), "<empty>");
        p.data.insert("k".into(), serde_json::json!(1));
        assert_eq!(p.summary(), "data(1 keys)");
    }
}
