use crate::domain::event::ReflectionEvent;
use crate::domain::feedback::{FeedbackEvent, FeedbackReason};
use crate::services::reflection::ReflectionBus;
use opentelemetry::{KeyValue, global, metrics::Counter};
use tokio::sync::{mpsc, watch};

#[derive(Clone, Debug)]
struct Metrics {
    feedback: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("push-relay");
        Self {
            feedback: meter
                .u64_counter("push_feedback_total")
                .with_description("Total feedback events received from push backends")
                .build(),
        }
    }
}

/// Publishes backend feedback on the reflection bus. Acting on it, e.g. deleting a dead
/// token, is left to the handlers.
#[derive(Debug)]
pub struct FeedbackWorker {
    rx: mpsc::Receiver<FeedbackEvent>,
    bus: ReflectionBus,
    metrics: Metrics,
}

impl FeedbackWorker {
    #[must_use]
    pub fn new(rx: mpsc::Receiver<FeedbackEvent>, bus: ReflectionBus) -> Self {
        Self { rx, bus, metrics: Metrics::new() }
    }

    pub fn handle(&self, event: FeedbackEvent) {
        self.metrics.feedback.add(1, &[KeyValue::new("reason", event.reason.to_string())]);
        match event.reason {
            FeedbackReason::CertificateRevoked(error) => {
                self.bus.emit(ReflectionEvent::CertificateRevoked { app_id: event.app_id, error });
            }
            reason => {
                self.bus.emit(ReflectionEvent::Feedback {
                    app_id: event.app_id,
                    device_token: event.device_token,
                    reason,
                });
            }
        }
    }

    /// Runs until shutdown, then drains whatever feedback is already queued.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        while !*shutdown.borrow() {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = shutdown.changed() => {}
            }
        }

        self.rx.close();
        while let Some(event) = self.rx.recv().await {
            self.handle(event);
        }
        tracing::info!("Feedback worker shutting down...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::app::AppId;
    use crate::domain::event::EventKind;
    use crate::services::reflection::{RecordingHandler, ReflectionHandler};
    use std::sync::Arc;

    fn worker() -> (FeedbackWorker, Arc<RecordingHandler>, mpsc::Sender<FeedbackEvent>) {
        let recorder = Arc::new(RecordingHandler::new());
        let bus = ReflectionBus::new(vec![Arc::clone(&recorder) as Arc<dyn ReflectionHandler>]);
        let (tx, rx) = mpsc::channel(8);
        (FeedbackWorker::new(rx, bus), recorder, tx)
    }

    #[test]
    fn test_token_feedback_becomes_feedback_event() {
        let (worker, recorder, _tx) = worker();
        worker.handle(FeedbackEvent::new(AppId::from("ios"), "tok", FeedbackReason::Unregistered));

        let events = recorder.of_kind(EventKind::Feedback);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ReflectionEvent::Feedback { device_token, reason: FeedbackReason::Unregistered, .. } if device_token == "tok"
        ));
        assert_eq!(recorder.count(EventKind::CertificateRevoked), 0);
    }

    #[test]
    fn test_revoked_certificate_becomes_revocation_event() {
        let (worker, recorder, _tx) = worker();
        worker.handle(FeedbackEvent::new(
            AppId::from("ios"),
            "tok",
            FeedbackReason::CertificateRevoked("BadCertificate".into()),
        ));

        assert_eq!(recorder.count(EventKind::CertificateRevoked), 1);
        assert_eq!(recorder.count(EventKind::Feedback), 0);
    }

    #[tokio::test]
    async fn test_run_drains_queue_on_shutdown() {
        let (worker, recorder, tx) = worker();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        for token in ["a", "b"] {
            tx.send(FeedbackEvent::new(AppId::from("ios"), token, FeedbackReason::InvalidToken)).await.unwrap();
        }
        shutdown_tx.send(true).unwrap();

        worker.run(shutdown_rx).await;

        assert_eq!(recorder.count(EventKind::Feedback), 2);
    }
}
