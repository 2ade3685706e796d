use crate::config::PollerConfig;
use crate::error::Result;
use crate::services::app_registry::AppRegistry;
use crate::services::runners::AppRunners;
use crate::storage::NotificationStore;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use opentelemetry::{global, metrics::Counter};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::Instrument;

#[derive(Clone, Debug)]
struct Metrics {
    claimed: Counter<u64>,
    deferred: Counter<u64>,
    poll_errors: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("push-relay");
        Self {
            claimed: meter
                .u64_counter("push_claimed_total")
                .with_description("Total notifications claimed from the store")
                .build(),
            deferred: meter
                .u64_counter("push_poll_deferred_total")
                .with_description("Total claims handed back because their app is paused")
                .build(),
            poll_errors: meter
                .u64_counter("push_poll_errors_total")
                .with_description("Total polls that failed because the store was unavailable")
                .build(),
        }
    }
}

/// Claims due notifications in batches and hands them to the app runners.
/// Claims for paused apps go straight back to the store.
#[derive(Debug)]
pub struct Poller {
    store: Arc<dyn NotificationStore>,
    registry: Arc<AppRegistry>,
    runners: Arc<AppRunners>,
    paused_defer: Duration,
    interval: Duration,
    batch_size: usize,
    runner_idle: Duration,
    store_backoff_max: Duration,
    metrics: Metrics,
}

impl Poller {
    #[must_use]
    pub fn new(
        store: Arc<dyn NotificationStore>,
        registry: Arc<AppRegistry>,
        runners: Arc<AppRunners>,
        config: &PollerConfig,
        paused_defer: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            runners,
            paused_defer,
            interval: Duration::from_secs(config.push_poll),
            batch_size: config.batch_size,
            runner_idle: Duration::from_secs(config.runner_idle_secs),
            store_backoff_max: Duration::from_secs(config.store_backoff_max_secs),
            metrics: Metrics::new(),
        }
    }

    fn store_backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.interval)
            .with_max_delay(self.store_backoff_max.max(self.interval))
            .with_jitter()
            .without_max_times()
            .build()
    }

    /// Claims as many notifications as fit under the batch size and dispatches them.
    /// Returns the number claimed.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable` if the claim failed; nothing was dispatched.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn poll_once(&self) -> Result<usize> {
        let room = self.batch_size.saturating_sub(self.runners.total_queued());
        if room == 0 {
            tracing::debug!("Runner queues are full, skipping claim");
            return Ok(0);
        }

        let claimed = self.store.enqueue_pending(room).await?;
        let count = claimed.len();
        if count == 0 {
            return Ok(0);
        }

        tracing::info!(count, "Claimed notifications");
        self.metrics.claimed.add(count as u64, &[]);
        let deliver_after = OffsetDateTime::now_utc() + self.paused_defer;
        for notification in claimed {
            if self.registry.is_paused(&notification.app_id) {
                match self.store.release(notification.id, deliver_after).await {
                    Ok(_) => {
                        self.metrics.deferred.add(1, &[]);
                        continue;
                    }
                    // The delivery worker checks the pause again and retries the release.
                    Err(e) => tracing::warn!(notification_id = %notification.id, error = %e, "Failed to defer claim"),
                }
            }
            self.runners.dispatch(notification);
        }
        Ok(count)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff: Option<ExponentialBackoff> = None;
        tracing::info!(interval = ?self.interval, batch_size = self.batch_size, "Poller started");

        while !*shutdown.borrow() {
            let delay = match self.poll_once().instrument(tracing::debug_span!("poll_iteration")).await {
                Ok(_) => {
                    if backoff.take().is_some() {
                        tracing::info!("Notification store reachable again");
                    }
                    self.interval
                }
                Err(e) => {
                    self.metrics.poll_errors.add(1, &[]);
                    let delay = backoff
                        .get_or_insert_with(|| self.store_backoff())
                        .next()
                        .unwrap_or(self.store_backoff_max);
                    tracing::warn!(error = %e, retry_in = ?delay, "Failed to claim notifications");
                    delay
                }
            };

            let reaped = self.runners.reap_idle(self.runner_idle).await;
            if !reaped.is_empty() {
                tracing::debug!(count = reaped.len(), "Stopped idle app runners");
            }

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Poller shutting down...");
    }
}
