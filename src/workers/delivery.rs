use crate::adapters::backend::Backend;
use crate::config::DeliveryConfig;
use crate::domain::app::{App, AppId};
use crate::domain::event::{Delivered, Failed, PartiallyDelivered, ReflectionEvent, WillRetry};
use crate::domain::feedback::{FeedbackEvent, FeedbackReason};
use crate::domain::notification::{DeliveryFailure, DeliveryProgress, Notification, RecipientFailure};
use crate::error::{Error, Result};
use crate::services::app_registry::AppRegistry;
use crate::services::connection_pool::{Connection, ConnectionPool};
use crate::services::reflection::ReflectionBus;
use crate::services::retry::{RetryDecision, RetryPolicy};
use crate::storage::NotificationStore;
use futures::FutureExt;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
struct Metrics {
    delivered: Counter<u64>,
    partially_delivered: Counter<u64>,
    failed: Counter<u64>,
    retried: Counter<u64>,
    deferred: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("push-relay");
        Self {
            delivered: meter
                .u64_counter("push_delivered_total")
                .with_description("Total notifications accepted by every recipient")
                .build(),
            partially_delivered: meter
                .u64_counter("push_partially_delivered_total")
                .with_description("Total fan-outs accepted by some recipients and rejected by the rest")
                .build(),
            failed: meter
                .u64_counter("push_failed_total")
                .with_description("Total notifications failed permanently")
                .build(),
            retried: meter
                .u64_counter("push_retried_total")
                .with_description("Total notifications scheduled for another attempt")
                .build(),
            deferred: meter
                .u64_counter("push_deferred_total")
                .with_description("Total claimed notifications handed back because their app is paused")
                .build(),
        }
    }
}

/// Where a processed notification ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    PartiallyDelivered,
    Failed,
    Retrying,
    /// The app is paused; the notification went back to the queue untouched.
    Deferred,
    /// Another worker owned the notification.
    Skipped,
}

/// What the send loop learned about the recipients it tried.
enum SendReport {
    Finished { last_transient: Option<Error> },
    AppFatal(Error),
}

/// Sends one claimed notification through its app's connection and records the result.
///
/// Shared by every app runner. Nothing that goes wrong for one notification, including a
/// panic in a backend, escapes `deliver`.
#[derive(Debug)]
pub struct DeliveryWorker {
    store: Arc<dyn NotificationStore>,
    registry: Arc<AppRegistry>,
    pool: Arc<ConnectionPool>,
    bus: ReflectionBus,
    retry: RetryPolicy,
    feedback_tx: mpsc::Sender<FeedbackEvent>,
    send_timeout: Duration,
    delivered_ttl: Duration,
    failed_ttl: Duration,
    paused_defer: Duration,
    metrics: Metrics,
}

impl DeliveryWorker {
    #[must_use]
    pub fn new(
        store: Arc<dyn NotificationStore>,
        registry: Arc<AppRegistry>,
        pool: Arc<ConnectionPool>,
        bus: ReflectionBus,
        retry: RetryPolicy,
        feedback_tx: mpsc::Sender<FeedbackEvent>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            store,
            registry,
            pool,
            bus,
            retry,
            feedback_tx,
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            delivered_ttl: Duration::from_secs(config.delivered_ttl_secs),
            failed_ttl: Duration::from_secs(config.failed_ttl_secs),
            paused_defer: Duration::from_secs(config.paused_defer_secs),
            metrics: Metrics::new(),
        }
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Sends allowed at once on the app's connection. Unknown apps get one.
    #[must_use]
    pub fn concurrency_for(&self, app_id: &AppId) -> usize {
        self.registry
            .get(app_id)
            .and_then(|app| self.pool.backend_for(&app).ok().map(|b| b.connection_kind(&app).concurrency()))
            .unwrap_or(1)
    }

    /// Processes one notification. Errors and panics are logged and published as `error` events.
    pub async fn deliver(&self, notification: Notification) -> Option<DeliveryOutcome> {
        let app_id = notification.app_id.clone();
        let id = notification.id;

        match AssertUnwindSafe(self.process(notification)).catch_unwind().await {
            Ok(Ok(outcome)) => Some(outcome),
            Ok(Err(e)) => {
                tracing::error!(notification_id = %id, app_id = %app_id, error = %e, "Delivery failed with error");
                self.bus.error(Some(app_id), e);
                None
            }
            Err(_) => {
                tracing::error!(notification_id = %id, app_id = %app_id, "Delivery panicked");
                self.bus.error(Some(app_id), Error::Internal(format!("delivery of {id} panicked")));
                None
            }
        }
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(notification_id = %notification.id, app_id = %notification.app_id)
    )]
    async fn process(&self, mut notification: Notification) -> Result<DeliveryOutcome> {
        if !self.store.mark_sending(notification.id).await? {
            tracing::debug!("Notification is owned by another worker, skipping");
            return Ok(DeliveryOutcome::Skipped);
        }

        let Some(app) = self.registry.get(&notification.app_id) else {
            let error = Error::NotFound(format!("app {} is not registered", notification.app_id));
            return self.fail(&notification, &DeliveryFailure::from(&error)).await;
        };

        if self.registry.is_paused(&app.id) {
            return self.defer(&notification).await;
        }

        let backend = match self.pool.backend_for(&app) {
            Ok(backend) => backend,
            Err(e) => return self.fail(&notification, &DeliveryFailure::from(&e)).await,
        };

        let connection = match self.pool.acquire(&app).await {
            Ok(connection) => connection,
            Err(e) if e.is_app_fatal() => return self.handle_app_fatal(&app, &notification, e, None).await,
            Err(e) if e.is_transient() => return self.schedule_retry(&app, &notification, &e).await,
            Err(e) => return self.fail(&notification, &DeliveryFailure::from(&e)).await,
        };

        let report = self.send_pending(backend.as_ref(), &app, &mut notification, &connection).await;
        self.pool.release(connection).await;

        match report {
            SendReport::AppFatal(e) => {
                let recipient = notification.pending_recipients().first().map(|t| (*t).to_string());
                self.handle_app_fatal(&app, &notification, e, recipient).await
            }
            SendReport::Finished { last_transient } => self.resolve(&app, &notification, last_transient).await,
        }
    }

    /// Sends to every recipient not yet settled, recording each outcome in `notification.progress`.
    async fn send_pending(
        &self,
        backend: &dyn Backend,
        app: &Arc<App>,
        notification: &mut Notification,
        connection: &Connection,
    ) -> SendReport {
        let fan_out = notification.recipients.len() > 1;
        let pending: Vec<String> = notification.pending_recipients().into_iter().map(str::to_string).collect();
        let mut last_transient = None;

        for recipient in pending {
            let sent = tokio::time::timeout(
                self.send_timeout,
                backend.send(connection.transport(), app, notification, &recipient),
            )
            .await
            .unwrap_or(Err(Error::Timeout));

            match sent {
                Ok(receipt) => {
                    if let Some(new_token) = receipt.canonical_token {
                        self.bus.emit(ReflectionEvent::CanonicalId {
                            app_id: app.id.clone(),
                            old_token: recipient.clone(),
                            new_token,
                        });
                    }
                    if fan_out {
                        self.bus.emit(ReflectionEvent::DeliveredToRecipient {
                            notification_id: notification.id,
                            token: recipient.clone(),
                        });
                    }
                    notification.progress.delivered_to.push(recipient);
                }
                Err(e) if e.is_app_fatal() => return SendReport::AppFatal(e),
                Err(e @ Error::Connection(_)) => {
                    self.pool.report_lost(Arc::clone(app), connection, &e).await;
                    last_transient = Some(e);
                    break;
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(recipient = %recipient, error = %e, "Transient send failure");
                    last_transient = Some(e);
                }
                Err(e) => {
                    if let Some(feedback) = backend.parse_feedback(app, &recipient, &e) {
                        self.forward_feedback(feedback).await;
                    }
                    if fan_out {
                        self.bus.emit(ReflectionEvent::FailedToRecipient {
                            notification_id: notification.id,
                            token: recipient.clone(),
                            error_code: e.code(),
                            error_description: e.description(),
                        });
                    }
                    notification.progress.failed_to.push(RecipientFailure {
                        token: recipient,
                        code: e.code(),
                        description: e.description(),
                    });
                }
            }
        }
        SendReport::Finished { last_transient }
    }

    async fn resolve(
        &self,
        app: &App,
        notification: &Notification,
        last_transient: Option<Error>,
    ) -> Result<DeliveryOutcome> {
        if !notification.pending_recipients().is_empty() {
            let error = last_transient.unwrap_or_else(|| Error::Internal("recipients left unsent".into()));
            return self.schedule_retry(app, notification, &error).await;
        }

        if notification.recipients.is_empty() {
            let failure = DeliveryFailure::new("no_recipients", "notification has no recipients");
            return self.fail(notification, &failure).await;
        }

        // Delivered only when every recipient accepted, failed only when none did.
        let progress = &notification.progress;
        let Some(first_failure) = progress.failed_to.first() else {
            return self.succeed(notification).await;
        };
        let failure = DeliveryFailure::new(first_failure.code.clone(), first_failure.description.clone());
        if progress.delivered_to.is_empty() {
            return self.fail(notification, &failure).await;
        }
        self.partially_succeed(notification, &failure).await
    }

    async fn succeed(&self, notification: &Notification) -> Result<DeliveryOutcome> {
        if !self.store.mark_delivered(notification.id, &notification.progress).await? {
            tracing::debug!("Lost ownership before marking delivered");
            return Ok(DeliveryOutcome::Skipped);
        }
        self.store.expire(notification.id, self.delivered_ttl).await?;

        self.metrics.delivered.add(1, &[KeyValue::new("app_id", notification.app_id.to_string())]);
        self.bus.emit(ReflectionEvent::NotificationDelivered(Delivered {
            notification_id: notification.id,
            app_id: notification.app_id.clone(),
            device_tokens: notification.progress.delivered_to.clone(),
            payload_summary: notification.payload.summary(),
        }));
        Ok(DeliveryOutcome::Delivered)
    }

    async fn partially_succeed(
        &self,
        notification: &Notification,
        failure: &DeliveryFailure,
    ) -> Result<DeliveryOutcome> {
        let progress = &notification.progress;
        if !self.store.mark_partially_delivered(notification.id, failure, progress).await? {
            tracing::debug!("Lost ownership before marking partially delivered");
            return Ok(DeliveryOutcome::Skipped);
        }
        self.store.expire(notification.id, self.delivered_ttl).await?;

        self.metrics.partially_delivered.add(1, &[KeyValue::new("app_id", notification.app_id.to_string())]);
        self.bus.emit(ReflectionEvent::NotificationPartiallyDelivered(PartiallyDelivered {
            notification_id: notification.id,
            app_id: notification.app_id.clone(),
            delivered_to: progress.delivered_to.clone(),
            failed_to: progress.failed_to.iter().map(|f| f.token.clone()).collect(),
        }));
        Ok(DeliveryOutcome::PartiallyDelivered)
    }

    async fn fail(&self, notification: &Notification, failure: &DeliveryFailure) -> Result<DeliveryOutcome> {
        if !self.store.mark_failed(notification.id, failure, &notification.progress).await? {
            tracing::debug!("Lost ownership before marking failed");
            return Ok(DeliveryOutcome::Skipped);
        }
        self.store.expire(notification.id, self.failed_ttl).await?;

        self.metrics.failed.add(
            1,
            &[KeyValue::new("app_id", notification.app_id.to_string()), KeyValue::new("code", failure.code.clone())],
        );
        self.bus.emit(ReflectionEvent::NotificationFailed(Failed {
            notification_id: notification.id,
            app_id: notification.app_id.clone(),
            error_code: failure.code.clone(),
            error_description: failure.description.clone(),
        }));
        Ok(DeliveryOutcome::Failed)
    }

    /// Hands the notification back to the queue while its app is paused. Neither an attempt
    /// nor a failure is recorded.
    async fn defer(&self, notification: &Notification) -> Result<DeliveryOutcome> {
        let deliver_after = OffsetDateTime::now_utc() + self.paused_defer;
        if !self.store.release(notification.id, deliver_after).await? {
            tracing::debug!("Lost ownership before deferring");
            return Ok(DeliveryOutcome::Skipped);
        }
        tracing::debug!(deliver_after = %deliver_after, "App is paused, deferring notification");
        self.metrics.deferred.add(1, &[KeyValue::new("app_id", notification.app_id.to_string())]);
        Ok(DeliveryOutcome::Deferred)
    }

    async fn schedule_retry(&self, app: &App, notification: &Notification, error: &Error) -> Result<DeliveryOutcome> {
        let policy = match self.retry.for_app(app) {
            Ok(policy) => policy,
            Err(e) => return self.fail(notification, &DeliveryFailure::from(&e)).await,
        };
        match policy.next_attempt(notification.retries) {
            RetryDecision::GiveUp => {
                let failure = DeliveryFailure::new(
                    "retries_exhausted",
                    format!("gave up after {} retries: {}", notification.retries, error.description()),
                );
                self.fail(notification, &failure).await
            }
            RetryDecision::Retry { delay } => {
                let next_attempt = OffsetDateTime::now_utc() + delay;
                if !self.store.mark_retry(notification.id, next_attempt, &notification.progress).await? {
                    tracing::debug!("Lost ownership before scheduling retry");
                    return Ok(DeliveryOutcome::Skipped);
                }

                self.metrics.retried.add(1, &[KeyValue::new("app_id", notification.app_id.to_string())]);
                self.bus.emit(ReflectionEvent::NotificationWillRetry(WillRetry {
                    notification_id: notification.id,
                    app_id: notification.app_id.clone(),
                    next_attempt,
                    retries: notification.retries + 1,
                }));
                Ok(DeliveryOutcome::Retrying)
            }
        }
    }

    /// The app's credential is dead: pause the app so the rest of its queue fails fast, and
    /// report a revoked certificate through the feedback channel.
    async fn handle_app_fatal(
        &self,
        app: &App,
        notification: &Notification,
        error: Error,
        recipient: Option<String>,
    ) -> Result<DeliveryOutcome> {
        tracing::error!(error = %error, "App credential rejected by backend");
        if let Error::CredentialRevoked(description) = &error {
            let token = recipient.unwrap_or_else(|| notification.device_token().to_string());
            self.forward_feedback(FeedbackEvent::new(
                app.id.clone(),
                token,
                FeedbackReason::CertificateRevoked(description.clone()),
            ))
            .await;
        }
        self.registry.pause(&app.id, error.clone());
        self.pool.close(&app.id).await;
        self.fail(notification, &DeliveryFailure::from(&error)).await
    }

    async fn forward_feedback(&self, feedback: FeedbackEvent) {
        if self.feedback_tx.send(feedback).await.is_err() {
            tracing::warn!("Feedback channel closed, dropping feedback");
        }
    }
}
