#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod services;
pub mod storage;
pub mod telemetry;
pub mod workers;

use crate::adapters::backend::Backends;
use crate::config::Config;
use crate::domain::notification::Notification;
use crate::error::{Error, Result};
use crate::services::app_registry::{AppManifest, AppRegistry};
use crate::services::connection_pool::ConnectionPool;
use crate::services::reflection::{ReflectionBus, ReflectionHandler, TracingHandler};
use crate::services::retry::RetryPolicy;
use crate::services::runners::AppRunners;
use crate::storage::NotificationStore;
use crate::workers::{CertificateMonitor, DeliveryWorker, FeedbackWorker, Poller};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Background tasks of a running engine. Spawned once.
#[derive(Debug)]
pub struct Workers {
    pub poller: Poller,
    pub feedback: FeedbackWorker,
    pub certificate_monitor: CertificateMonitor,
}

impl Workers {
    #[must_use]
    pub fn spawn_all(self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.poller.run(shutdown_rx.clone()).instrument(tracing::info_span!("poller"))),
            tokio::spawn(self.feedback.run(shutdown_rx.clone()).instrument(tracing::info_span!("feedback_worker"))),
            tokio::spawn(
                self.certificate_monitor.run(shutdown_rx).instrument(tracing::info_span!("certificate_monitor")),
            ),
        ]
    }
}

/// The wired delivery engine: shared services plus the workers that drive them.
#[derive(Debug)]
pub struct Engine {
    pub config: Config,
    pub store: Arc<dyn NotificationStore>,
    pub registry: Arc<AppRegistry>,
    pub pool: Arc<ConnectionPool>,
    pub runners: Arc<AppRunners>,
    pub bus: ReflectionBus,
    pub workers: Workers,
}

impl Engine {
    /// Persists a notification for delivery. It is picked up by the next poll.
    ///
    /// # Errors
    /// Returns `Error::NotFound` for an unregistered app, or `Error::StoreUnavailable`.
    pub async fn submit(&self, notification: &Notification) -> Result<()> {
        if self.registry.get(&notification.app_id).is_none() {
            return Err(Error::NotFound(format!("app {} is not registered", notification.app_id)));
        }
        self.store.create(notification).await
    }

    /// Runs the workers until `shutdown_rx` flips, then drains runners within the grace period.
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) {
        let grace = Duration::from_secs(self.config.delivery.shutdown_grace_secs);
        let runners = Arc::clone(&self.runners);
        let mut wait_rx = shutdown_rx.clone();

        let tasks = self.workers.spawn_all(shutdown_rx);
        let _ = wait_rx.wait_for(|&s| s).await;

        tracing::info!("Shutting down push engine...");
        if tokio::time::timeout(grace, futures::future::join_all(tasks)).await.is_err() {
            tracing::warn!("Timeout waiting for background tasks to finish.");
        }
        runners.stop_all(grace).await;
        tracing::info!("Push engine stopped");
    }
}

/// Assembles an [`Engine`], running the startup steps that must finish before any polling:
/// reclaim stranded work, optionally pre-warm apps from the manifest, load the registry and
/// check required apps.
#[derive(Debug)]
pub struct EngineBuilder {
    config: Config,
    store: Option<Arc<dyn NotificationStore>>,
    backends: Backends,
    handlers: Vec<Arc<dyn ReflectionHandler>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config, store: None, backends: Backends::standard(), handlers: vec![Arc::new(TracingHandler)] }
    }

    /// Uses `store` instead of connecting to the configured one.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn NotificationStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_backends(mut self, backends: Backends) -> Self {
        self.backends = backends;
        self
    }

    /// Adds a reflection handler after the ones already registered.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ReflectionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// # Errors
    /// Returns `Error::Configuration` for invalid settings, a bad manifest or missing required
    /// apps, and `Error::StoreUnavailable` if the store cannot be reached.
    pub async fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => storage::connect(&config.store).await?,
        };

        let reclaimed = store.reclaim_in_flight().await?;
        if reclaimed > 0 {
            tracing::info!(count = reclaimed, "Reclaimed notifications left in flight by a previous run");
        }

        if config.apps.initialize_apps
            && let Some(manifest) = &config.apps.apps_manifest
        {
            let count = AppManifest::initialize(manifest, store.as_ref()).await?;
            tracing::info!(count, "Initialized apps from manifest");
        }

        let registry = Arc::new(AppRegistry::new());
        registry.load_from(store.as_ref()).await?;
        registry.require(&config.apps.required_apps)?;

        let bus = ReflectionBus::new(self.handlers);
        let pool = Arc::new(ConnectionPool::new(self.backends, bus.clone(), &config.connection));
        let (feedback_tx, feedback_rx) = mpsc::channel(config.connection.feedback_channel_capacity);

        let worker = Arc::new(DeliveryWorker::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&pool),
            bus.clone(),
            RetryPolicy::from_config(&config.retry),
            feedback_tx,
            &config.delivery,
        ));
        let runners = Arc::new(AppRunners::new(worker, bus.clone()));

        let workers = Workers {
            poller: Poller::new(
                Arc::clone(&store),
                Arc::clone(&registry),
                Arc::clone(&runners),
                &config.poller,
                Duration::from_secs(config.delivery.paused_defer_secs),
            ),
            feedback: FeedbackWorker::new(feedback_rx, bus.clone()),
            certificate_monitor: CertificateMonitor::new(Arc::clone(&registry), bus.clone(), &config.credentials),
        };

        Ok(Engine { config, store, registry, pool, runners, bus, workers })
    }
}

/// Flips the shutdown watch on SIGINT or SIGTERM.
pub fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl+c");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {}
            () = terminate => {}
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}

/// Routes panics through `tracing` so they reach the configured log outputs.
pub fn setup_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info.location().map(|l| format!("{}:{}", l.file(), l.line()));
        let payload = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_default();
        tracing::error!(location = ?location, panic = %payload, "Panic occurred");
    }));
}

/// Writes the current process id to `path`.
///
/// # Errors
/// Returns an I/O error if the file cannot be written.
pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("push-relay.pid");
        write_pid_file(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), std::process::id().to_string());
    }
}
