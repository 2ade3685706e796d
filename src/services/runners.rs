use crate::domain::app::AppId;
use crate::domain::event::ReflectionEvent;
use crate::domain::notification::Notification;
use crate::services::reflection::ReflectionBus;
use crate::workers::delivery::DeliveryWorker;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

#[derive(Debug)]
struct RunnerState {
    /// Queued plus in-flight notifications.
    queued: AtomicUsize,
    last_active_ms: AtomicU64,
    stopping: AtomicBool,
}

#[derive(Debug)]
struct Runner {
    tx: mpsc::UnboundedSender<Notification>,
    state: Arc<RunnerState>,
    handle: JoinHandle<()>,
}

/// One delivery runner per app, created on first dispatch and stopped when idle.
///
/// A runner takes notifications off its queue in claim order and hands each to the shared
/// [`DeliveryWorker`] under a semaphore sized from the app's connection kind, so a serial
/// backend sees one send at a time while a multiplexed one may complete out of order.
#[derive(Debug)]
pub struct AppRunners {
    runners: DashMap<AppId, Runner>,
    worker: Arc<DeliveryWorker>,
    bus: ReflectionBus,
    epoch: Instant,
}

impl AppRunners {
    #[must_use]
    pub fn new(worker: Arc<DeliveryWorker>, bus: ReflectionBus) -> Self {
        Self { runners: DashMap::new(), worker, bus, epoch: Instant::now() }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Queues a claimed notification on its app's runner, starting the runner if needed.
    pub fn dispatch(&self, notification: Notification) {
        let app_id = notification.app_id.clone();
        let notification_id = notification.id;

        let mut entry = self.runners.entry(app_id.clone()).or_insert_with(|| self.spawn_runner(&app_id));
        entry.state.last_active_ms.store(self.now_ms(), Ordering::Relaxed);
        let queue_size = entry.state.queued.fetch_add(1, Ordering::SeqCst) + 1;

        if let Err(mpsc::error::SendError(notification)) = entry.tx.send(notification) {
            // The runner task died. Replace it and queue again on the fresh one.
            tracing::warn!(app_id = %app_id, "App runner stopped unexpectedly, restarting");
            *entry = self.spawn_runner(&app_id);
            entry.state.queued.fetch_add(1, Ordering::SeqCst);
            if entry.tx.send(notification).is_err() {
                entry.state.queued.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(app_id = %app_id, "Could not queue notification on app runner");
                return;
            }
        }
        drop(entry);

        self.bus.emit(ReflectionEvent::NotificationEnqueued { notification_id, app_id, queue_size });
    }

    fn spawn_runner(&self, app_id: &AppId) -> Runner {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RunnerState {
            queued: AtomicUsize::new(0),
            last_active_ms: AtomicU64::new(self.now_ms()),
            stopping: AtomicBool::new(false),
        });
        let concurrency = self.worker.concurrency_for(app_id);
        tracing::debug!(app_id = %app_id, concurrency, "Starting app runner");

        let handle = tokio::spawn(
            Self::run(Arc::clone(&self.worker), rx, Arc::clone(&state), concurrency, self.epoch)
                .instrument(tracing::info_span!("app_runner", app_id = %app_id)),
        );
        Runner { tx, state, handle }
    }

    async fn run(
        worker: Arc<DeliveryWorker>,
        mut rx: mpsc::UnboundedReceiver<Notification>,
        state: Arc<RunnerState>,
        concurrency: usize,
        epoch: Instant,
    ) {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        // Dropping the set when the runner is aborted aborts every send still in it.
        let mut in_flight = JoinSet::new();

        while let Some(notification) = rx.recv().await {
            while in_flight.try_join_next().is_some() {}

            if state.stopping.load(Ordering::SeqCst) {
                // Left in `enqueued`; reclaimed on the next start.
                state.queued.fetch_sub(1, Ordering::SeqCst);
                continue;
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let worker = Arc::clone(&worker);
            let state = Arc::clone(&state);
            in_flight.spawn(
                async move {
                    let _permit = permit;
                    worker.deliver(notification).await;
                    state.queued.fetch_sub(1, Ordering::SeqCst);
                    let now = u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
                    state.last_active_ms.store(now, Ordering::Relaxed);
                }
                .in_current_span(),
            );
        }

        while in_flight.join_next().await.is_some() {}
        tracing::debug!("App runner stopped");
    }

    /// Notifications queued or in flight across every runner. The poller claims only
    /// up to the room left under its batch size.
    #[must_use]
    pub fn total_queued(&self) -> usize {
        self.runners.iter().map(|r| r.state.queued.load(Ordering::SeqCst)).sum()
    }

    #[must_use]
    pub fn queue_size(&self, app_id: &AppId) -> usize {
        self.runners.get(app_id).map_or(0, |r| r.state.queued.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    #[must_use]
    pub fn contains(&self, app_id: &AppId) -> bool {
        self.runners.contains_key(app_id)
    }

    /// Stops runners with nothing queued or in flight that have been idle for `idle`,
    /// closing their connections. Returns the apps whose runner was stopped.
    pub async fn reap_idle(&self, idle: Duration) -> Vec<AppId> {
        let now = self.now_ms();
        let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        let mut reaped = Vec::new();

        let candidates: Vec<AppId> = self
            .runners
            .iter()
            .filter(|r| {
                r.state.queued.load(Ordering::SeqCst) == 0
                    && now.saturating_sub(r.state.last_active_ms.load(Ordering::Relaxed)) >= idle_ms
            })
            .map(|r| r.key().clone())
            .collect();

        for app_id in candidates {
            // Re-checked under the entry lock so a concurrent dispatch keeps its runner.
            let removed = self.runners.remove_if(&app_id, |_, r| r.state.queued.load(Ordering::SeqCst) == 0);
            if let Some((_, runner)) = removed {
                drop(runner.tx);
                // A runner dispatched since the removal may already hold a lease on the connection.
                self.worker.pool().close_if_unused(&app_id).await;
                tracing::debug!(app_id = %app_id, "Stopped idle app runner");
                reaped.push(app_id);
            }
        }
        reaped
    }

    /// Stops every runner. Queued notifications that have not started are left for the next
    /// start; in-flight sends get `grace` to finish before their runners are aborted.
    pub async fn stop_all(&self, grace: Duration) {
        let ids: Vec<AppId> = self.runners.iter().map(|r| r.key().clone()).collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, runner)) = self.runners.remove(&id) {
                runner.state.stopping.store(true, Ordering::SeqCst);
                drop(runner.tx);
                handles.push(runner.handle);
            }
        }

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles)).await.is_err() {
            tracing::warn!("Runners did not finish within the shutdown grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        self.worker.pool().close_all().await;
    }
}
