use crate::domain::app::AppId;
use crate::domain::event::{Delivered, EventKind, Failed, PartiallyDelivered, ReflectionEvent, WillRetry};
use crate::domain::feedback::FeedbackReason;
use crate::error::Error;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use uuid::Uuid;

/// Reacts to engine events. Every method defaults to doing nothing, so handlers only
/// implement the events they care about.
///
/// Handlers run synchronously on the task that emitted the event. Anything slow (HTTP
/// calls, database writes) should be handed off to another task by the handler itself.
pub trait ReflectionHandler: Send + Sync + std::fmt::Debug {
    fn notification_enqueued(&self, _notification_id: Uuid, _app_id: &AppId, _queue_size: usize) {}

    fn notification_delivered(&self, _event: &Delivered) {}

    fn notification_partially_delivered(&self, _event: &PartiallyDelivered) {}

    /// Inspect `error_code` and `error_description` for the cause.
    fn notification_failed(&self, _event: &Failed) {}

    fn notification_will_retry(&self, _event: &WillRetry) {}

    /// Fires once per recipient of a multi-recipient notification.
    fn delivered_to_recipient(&self, _notification_id: Uuid, _token: &str) {}

    fn failed_to_recipient(&self, _notification_id: Uuid, _token: &str, _error_code: &str, _error_description: &str) {}

    fn tcp_connection_lost(&self, _app_id: &AppId, _error: &str) {}

    /// The token should not be sent to again.
    fn feedback(&self, _app_id: &AppId, _device_token: &str, _reason: &FeedbackReason) {}

    /// Future sends to `old_token` should go to `new_token`.
    fn canonical_id(&self, _app_id: &AppId, _old_token: &str, _new_token: &str) {}

    fn ssl_certificate_will_expire(&self, _app_id: &AppId, _expires_at: OffsetDateTime) {}

    fn ssl_certificate_revoked(&self, _app_id: &AppId, _error: &str) {}

    fn error(&self, _app_id: Option<&AppId>, _error: &Error) {}
}

fn dispatch(handler: &dyn ReflectionHandler, event: &ReflectionEvent) {
    match event {
        ReflectionEvent::NotificationEnqueued { notification_id, app_id, queue_size } => {
            handler.notification_enqueued(*notification_id, app_id, *queue_size);
        }
        ReflectionEvent::NotificationDelivered(e) => handler.notification_delivered(e),
        ReflectionEvent::NotificationPartiallyDelivered(e) => handler.notification_partially_delivered(e),
        ReflectionEvent::NotificationFailed(e) => handler.notification_failed(e),
        ReflectionEvent::NotificationWillRetry(e) => handler.notification_will_retry(e),
        ReflectionEvent::DeliveredToRecipient { notification_id, token } => {
            handler.delivered_to_recipient(*notification_id, token);
        }
        ReflectionEvent::FailedToRecipient { notification_id, token, error_code, error_description } => {
            handler.failed_to_recipient(*notification_id, token, error_code, error_description);
        }
        ReflectionEvent::TcpConnectionLost { app_id, error } => handler.tcp_connection_lost(app_id, error),
        ReflectionEvent::Feedback { app_id, device_token, reason } => handler.feedback(app_id, device_token, reason),
        ReflectionEvent::CanonicalId { app_id, old_token, new_token } => {
            handler.canonical_id(app_id, old_token, new_token);
        }
        ReflectionEvent::CertificateWillExpire { app_id, expires_at } => {
            handler.ssl_certificate_will_expire(app_id, *expires_at);
        }
        ReflectionEvent::CertificateRevoked { app_id, error } => handler.ssl_certificate_revoked(app_id, error),
        ReflectionEvent::Error { app_id, error } => handler.error(app_id.as_ref(), error),
    }
}

#[derive(Clone, Debug)]
struct Metrics {
    events: Counter<u64>,
    handler_panics: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("push-relay");
        Self {
            events: meter
                .u64_counter("reflection_events_total")
                .with_description("Total events published on the reflection bus")
                .build(),
            handler_panics: meter
                .u64_counter("reflection_handler_panics_total")
                .with_description("Total reflection handler invocations that panicked")
                .build(),
        }
    }
}

/// Fans events out to every registered handler, in registration order.
#[derive(Clone, Debug)]
pub struct ReflectionBus {
    handlers: Arc<Vec<Arc<dyn ReflectionHandler>>>,
    metrics: Metrics,
}

impl Default for ReflectionBus {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ReflectionBus {
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn ReflectionHandler>>) -> Self {
        Self { handlers: Arc::new(handlers), metrics: Metrics::new() }
    }

    pub fn emit(&self, event: ReflectionEvent) {
        let kind = event.kind();
        self.metrics.events.add(1, &[KeyValue::new("event", kind.as_str())]);

        for handler in self.handlers.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| dispatch(handler.as_ref(), &event)));
            if result.is_err() {
                self.metrics.handler_panics.add(1, &[KeyValue::new("event", kind.as_str())]);
                tracing::error!(event = kind.as_str(), handler = ?handler, "Reflection handler panicked");
            }
        }
    }

    pub fn error(&self, app_id: Option<AppId>, error: Error) {
        self.emit(ReflectionEvent::Error { app_id, error });
    }
}

/// Logs every event. Registered by default so deliveries and failures always reach the log.
#[derive(Debug, Default)]
pub struct TracingHandler;

impl ReflectionHandler for TracingHandler {
    fn notification_delivered(&self, event: &Delivered) {
        tracing::info!(
            notification_id = %event.notification_id,
            device_tokens = ?event.device_tokens,
            alert = %event.payload_summary,
            "Delivered notification"
        );
    }

    fn notification_partially_delivered(&self, event: &PartiallyDelivered) {
        tracing::info!(
            notification_id = %event.notification_id,
            delivered_to = ?event.delivered_to,
            failed_to = ?event.failed_to,
            "Notification delivered to some recipients only"
        );
    }

    fn notification_failed(&self, event: &Failed) {
        tracing::info!(
            notification_id = %event.notification_id,
            error_code = %event.error_code,
            error_description = %event.error_description,
            "Delivery failed for notification"
        );
    }

    fn notification_will_retry(&self, event: &WillRetry) {
        tracing::debug!(
            notification_id = %event.notification_id,
            retries = event.retries,
            next_attempt = %event.next_attempt,
            "Notification will be retried"
        );
    }

    fn tcp_connection_lost(&self, app_id: &AppId, error: &str) {
        tracing::warn!(app_id = %app_id, error = %error, "Connection lost, reconnecting");
    }

    fn feedback(&self, app_id: &AppId, device_token: &str, reason: &FeedbackReason) {
        tracing::info!(app_id = %app_id, device_token = %device_token, reason = %reason, "Received token feedback");
    }

    fn canonical_id(&self, app_id: &AppId, old_token: &str, new_token: &str) {
        tracing::info!(app_id = %app_id, old_token = %old_token, new_token = %new_token, "Device token superseded");
    }

    fn ssl_certificate_will_expire(&self, app_id: &AppId, expires_at: OffsetDateTime) {
        tracing::warn!(app_id = %app_id, expires_at = %expires_at, "App certificate is about to expire");
    }

    fn ssl_certificate_revoked(&self, app_id: &AppId, error: &str) {
        tracing::error!(app_id = %app_id, error = %error, "App certificate has been revoked");
    }

    fn error(&self, app_id: Option<&AppId>, error: &Error) {
        tracing::error!(app_id = ?app_id.map(AppId::as_str), error = %error, "Push engine error");
    }
}

/// Keeps every event in memory. Meant for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<ReflectionEvent>>,
}

impl RecordingHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<ReflectionEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn of_kind(&self, kind: EventKind) -> Vec<ReflectionEvent> {
        self.events().into_iter().filter(|e| e.kind() == kind).collect()
    }

    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.of_kind(kind).len()
    }

    fn record(&self, event: ReflectionEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl ReflectionHandler for RecordingHandler {
    fn notification_enqueued(&self, notification_id: Uuid, app_id: &AppId, queue_size: usize) {
        self.record(ReflectionEvent::NotificationEnqueued { notification_id, app_id: app_id.clone(), queue_size });
    }

    fn notification_delivered(&self, event: &Delivered) {
        self.record(ReflectionEvent::NotificationDelivered(event.clone()));
    }

    fn notification_partially_delivered(&self, event: &PartiallyDelivered) {
        self.record(ReflectionEvent::NotificationPartiallyDelivered(event.clone()));
    }

    fn notification_failed(&self, event: &Failed) {
        self.record(ReflectionEvent::NotificationFailed(event.clone()));
    }

    fn notification_will_retry(&self, event: &WillRetry) {
        self.record(ReflectionEvent::NotificationWillRetry(event.clone()));
    }

    fn delivered_to_recipient(&self, notification_id: Uuid, token: &str) {
        self.record(ReflectionEvent::DeliveredToRecipient { notification_id, token: token.to_string() });
    }

    fn failed_to_recipient(&self, notification_id: Uuid, token: &str, error_code: &str, error_description: &str) {
        self.record(ReflectionEvent::FailedToRecipient {
            notification_id,
            token: token.to_string(),
            error_code: error_code.to_string(),
            error_description: error_description.to_string(),
        });
    }

    fn tcp_connection_lost(&self, app_id: &AppId, error: &str) {
        self.record(ReflectionEvent::TcpConnectionLost { app_id: app_id.clone(), error: error.to_string() });
    }

    fn feedback(&self, app_id: &AppId, device_token: &str, reason: &FeedbackReason) {
        self.record(ReflectionEvent::Feedback {
            app_id: app_id.clone(),
            device_token: device_token.to_string(),
            reason: reason.clone(),
        });
    }

    fn canonical_id(&self, app_id: &AppId, old_token: &str, new_token: &str) {
        self.record(ReflectionEvent::CanonicalId {
            app_id: app_id.clone(),
            old_token: old_token.to_string(),
            new_token: new_token.to_string(),
        });
    }

    fn ssl_certificate_will_expire(&self, app_id: &AppId, expires_at: OffsetDateTime) {
        self.record(ReflectionEvent::CertificateWillExpire { app_id: app_id.clone(), expires_at });
    }

    fn ssl_certificate_revoked(&self, app_id: &AppId, error: &str) {
        self.record(ReflectionEvent::CertificateRevoked { app_id: app_id.clone(), error: error.to_string() });
    }

    fn error(&self, app_id: Option<&AppId>, error: &Error) {
        self.record(ReflectionEvent::Error { app_id: app_id.cloned(), error: error.clone() });
    }
}
