use crate::adapters::backend::{Backend, Backends, ConnectOptions, Transport};
use crate::config::ConnectionConfig;
use crate::domain::app::{App, AppId};
use crate::domain::event::ReflectionEvent;
use crate::error::{Error, Result};
use crate::services::reflection::ReflectionBus;
use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Connected,
    Reconnecting,
    Closed,
}

/// A lease on an app's live transport. Only valid for the slot and generation it was issued for.
#[derive(Debug, Clone)]
pub struct Connection {
    slot: Arc<Mutex<Slot>>,
    generation: u64,
    transport: Arc<dyn Transport>,
}

impl Connection {
    #[must_use]
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }
}

#[derive(Debug)]
struct Slot {
    health: ConnectionHealth,
    generation: u64,
    fingerprint: String,
    transport: Option<Arc<dyn Transport>>,
    leases: usize,
    reconnect_task: Option<JoinHandle<()>>,
    /// Detached from the pool; an `acquire` that was waiting on it must fetch a fresh slot.
    retired: bool,
}

impl Slot {
    const fn closed() -> Self {
        Self {
            health: ConnectionHealth::Closed,
            generation: 0,
            fingerprint: String::new(),
            transport: None,
            leases: 0,
            reconnect_task: None,
            retired: false,
        }
    }

    fn install(&mut self, app: &App, transport: Arc<dyn Transport>) {
        self.generation += 1;
        self.fingerprint = app.credential.fingerprint();
        self.transport = Some(transport);
        self.health = ConnectionHealth::Connected;
    }

    async fn shut(&mut self) {
        if let Some(task) = self.reconnect_task.take() {
            task.abort();
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        self.health = ConnectionHealth::Closed;
    }
}

#[derive(Clone, Debug)]
struct Metrics {
    connects: Counter<u64>,
    lost: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("push-relay");
        Self {
            connects: meter
                .u64_counter("push_connections_opened_total")
                .with_description("Total backend connections established")
                .build(),
            lost: meter
                .u64_counter("push_connection_lost_total")
                .with_description("Total backend connections lost while in use")
                .build(),
        }
    }
}

/// Long-lived backend connections, one slot per app.
///
/// Only the app's runner acquires from its slot, so a slot has a single writer. A lost
/// connection is rebuilt in the background with exponential backoff; sends that were in
/// flight on it fail back to their callers and are never replayed.
#[derive(Debug)]
pub struct ConnectionPool {
    slots: DashMap<AppId, Arc<Mutex<Slot>>>,
    backends: Backends,
    bus: ReflectionBus,
    options: ConnectOptions,
    reconnect_min: Duration,
    reconnect_max: Duration,
    metrics: Metrics,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(backends: Backends, bus: ReflectionBus, config: &ConnectionConfig) -> Self {
        Self {
            slots: DashMap::new(),
            backends,
            bus,
            options: ConnectOptions { connect_timeout: Duration::from_millis(config.connect_timeout_ms) },
            reconnect_min: Duration::from_millis(config.reconnect_min_ms),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms),
            metrics: Metrics::new(),
        }
    }

    /// # Errors
    /// Returns `Error::Configuration` if no backend handles the app's kind.
    pub fn backend_for(&self, app: &App) -> Result<Arc<dyn Backend>> {
        self.backends.get(app.backend)
    }

    fn slot(&self, app_id: &AppId) -> Arc<Mutex<Slot>> {
        Arc::clone(self.slots.entry(app_id.clone()).or_insert_with(|| Arc::new(Mutex::new(Slot::closed()))).value())
    }

    async fn connect(backend: &dyn Backend, app: &App, options: &ConnectOptions) -> Result<Arc<dyn Transport>> {
        match tokio::time::timeout(options.connect_timeout, backend.connect(app, options)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Connection(format!("connecting to {} timed out", app.backend.as_str()))),
        }
    }

    /// Returns a lease on the app's connection, connecting lazily. A credential rotation since
    /// the connection was opened forces a fresh connection.
    ///
    /// # Errors
    /// Returns `Error::Connection` while the slot is reconnecting or the connect attempt fails,
    /// and credential errors from the backend as-is.
    #[tracing::instrument(level = "debug", skip_all, fields(app_id = %app.id))]
    pub async fn acquire(&self, app: &App) -> Result<Connection> {
        let (slot_ref, mut slot) = loop {
            let slot_ref = self.slot(&app.id);
            let slot = Arc::clone(&slot_ref).lock_owned().await;
            if !slot.retired {
                break (slot_ref, slot);
            }
        };

        match slot.health {
            ConnectionHealth::Reconnecting => {
                return Err(Error::Connection(format!("connection for app {} is reconnecting", app.id)));
            }
            ConnectionHealth::Connected if slot.fingerprint != app.credential.fingerprint() => {
                tracing::info!("Credential changed, replacing connection");
                slot.shut().await;
            }
            ConnectionHealth::Connected | ConnectionHealth::Closed => {}
        }

        if slot.transport.is_none() {
            let backend = self.backend_for(app)?;
            let transport = Self::connect(backend.as_ref(), app, &self.options).await?;
            slot.install(app, transport);
            self.metrics.connects.add(1, &[KeyValue::new("backend", app.backend.as_str())]);
            tracing::info!(generation = slot.generation, "Connected to backend");
        }

        let transport = slot.transport.clone().ok_or_else(|| Error::Connection("no transport".into()))?;
        slot.leases += 1;
        let generation = slot.generation;
        drop(slot);
        Ok(Connection { slot: slot_ref, generation, transport })
    }

    /// Returns a lease. Leases from a replaced generation or a closed slot are simply dropped.
    pub async fn release(&self, connection: Connection) {
        let mut slot = connection.slot.lock().await;
        if slot.generation == connection.generation && !slot.retired {
            slot.leases = slot.leases.saturating_sub(1);
        }
    }

    /// Marks the connection behind `connection` as lost and starts reconnecting. Only the first
    /// report for a generation has an effect. Returns whether this call started the reconnect.
    #[tracing::instrument(level = "debug", skip_all, fields(app_id = %app.id))]
    pub async fn report_lost(&self, app: Arc<App>, connection: &Connection, error: &Error) -> bool {
        let slot_ref = Arc::clone(&connection.slot);
        let mut slot = slot_ref.lock().await;
        if slot.retired || slot.generation != connection.generation || slot.health != ConnectionHealth::Connected {
            return false;
        }

        slot.health = ConnectionHealth::Reconnecting;
        slot.leases = 0;
        if let Some(transport) = slot.transport.take() {
            transport.close().await;
        }
        self.metrics.lost.add(1, &[KeyValue::new("backend", app.backend.as_str())]);
        self.bus.emit(ReflectionEvent::TcpConnectionLost { app_id: app.id.clone(), error: error.to_string() });

        let backend = match self.backend_for(&app) {
            Ok(backend) => backend,
            Err(e) => {
                slot.health = ConnectionHealth::Closed;
                self.bus.error(Some(app.id.clone()), e);
                return true;
            }
        };

        let strategy = ExponentialBuilder::default()
            .with_min_delay(self.reconnect_min)
            .with_max_delay(self.reconnect_max)
            .with_jitter()
            .without_max_times();
        let options = self.options;
        let bus = self.bus.clone();
        let metrics = self.metrics.clone();
        let task_slot = Arc::clone(&slot_ref);
        let span = tracing::info_span!("reconnect", app_id = %app.id);

        slot.reconnect_task = Some(tokio::spawn(
            async move {
                let result = (|| async { Self::connect(backend.as_ref(), &app, &options).await })
                    .retry(strategy)
                    .when(|e: &Error| !e.is_app_fatal() && !matches!(e, Error::Configuration(_)))
                    .notify(|e, duration| {
                        tracing::debug!(error = %e, "Reconnect failed, retrying in {:?}", duration);
                    })
                    .await;

                let mut slot = task_slot.lock().await;
                slot.reconnect_task = None;
                if slot.health != ConnectionHealth::Reconnecting {
                    return;
                }
                match result {
                    Ok(transport) => {
                        slot.install(&app, transport);
                        metrics.connects.add(1, &[KeyValue::new("backend", app.backend.as_str())]);
                        tracing::info!(generation = slot.generation, "Reconnected to backend");
                    }
                    Err(e) => {
                        slot.health = ConnectionHealth::Closed;
                        tracing::error!(error = %e, "Giving up on reconnect");
                        bus.error(Some(app.id.clone()), e);
                    }
                }
            }
            .instrument(span),
        ));
        true
    }

    pub async fn health(&self, app_id: &AppId) -> Option<ConnectionHealth> {
        let slot = self.slots.get(app_id).map(|s| Arc::clone(s.value()))?;
        let health = slot.lock().await.health;
        Some(health)
    }

    /// Leases handed out for the current generation and not yet released.
    pub async fn leases(&self, app_id: &AppId) -> usize {
        let Some(slot) = self.slots.get(app_id).map(|s| Arc::clone(s.value())) else {
            return 0;
        };
        let leases = slot.lock().await.leases;
        leases
    }

    pub async fn close(&self, app_id: &AppId) {
        if let Some((_, slot)) = self.slots.remove(app_id) {
            let mut slot = slot.lock().await;
            slot.retired = true;
            slot.shut().await;
            tracing::debug!(app_id = %app_id, "Closed connection");
        }
    }

    /// Closes the app's connection unless a lease on it is still outstanding.
    /// Returns whether the app is left without a connection.
    pub async fn close_if_unused(&self, app_id: &AppId) -> bool {
        let Some(slot_ref) = self.slots.get(app_id).map(|s| Arc::clone(s.value())) else {
            return true;
        };
        let mut slot = slot_ref.lock().await;
        if slot.leases > 0 {
            tracing::debug!(app_id = %app_id, leases = slot.leases, "Connection in use, keeping it open");
            return false;
        }
        self.slots.remove_if(app_id, |_, current| Arc::ptr_eq(current, &slot_ref));
        slot.retired = true;
        slot.shut().await;
        tracing::debug!(app_id = %app_id, "Closed idle connection");
        true
    }

    pub async fn close_all(&self) {
        let ids: Vec<AppId> = self.slots.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close(&id).await;
        }
    }
}
