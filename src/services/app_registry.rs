use crate::domain::app::{App, AppId};
use crate::error::{Error, Result};
use crate::storage::NotificationStore;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

/// Apps known to this daemon and whether their delivery is paused.
///
/// Registering an app with an id that already exists rotates it: the new value replaces the
/// old one and a pause caused by a dead credential is lifted.
#[derive(Debug, Default)]
pub struct AppRegistry {
    apps: DashMap<AppId, Arc<App>>,
    paused: DashMap<AppId, Error>,
}

impl AppRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(app_id = %app.id))]
    pub fn register(&self, app: App) -> Arc<App> {
        let app = Arc::new(app);
        let previous = self.apps.insert(app.id.clone(), Arc::clone(&app));
        if let Some(previous) = previous
            && previous.credential.fingerprint() != app.credential.fingerprint()
        {
            tracing::info!("App credential rotated");
            self.resume(&app.id);
        }
        app
    }

    /// Persists `app` and then registers it, so a rotation survives a restart.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable`; the registry is left unchanged in that case.
    pub async fn save(&self, store: &dyn NotificationStore, app: App) -> Result<Arc<App>> {
        store.save_app(&app).await?;
        Ok(self.register(app))
    }

    #[must_use]
    pub fn get(&self, id: &AppId) -> Option<Arc<App>> {
        self.apps.get(id).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<App>> {
        self.apps.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn remove(&self, id: &AppId) -> Option<Arc<App>> {
        self.paused.remove(id);
        self.apps.remove(id).map(|(_, app)| app)
    }

    /// Stops delivery for the app until it is resumed or its credential is rotated.
    /// Notifications claimed meanwhile go back to the queue.
    pub fn pause(&self, id: &AppId, reason: Error) {
        tracing::warn!(app_id = %id, reason = %reason, "Pausing delivery for app");
        self.paused.insert(id.clone(), reason);
    }

    pub fn resume(&self, id: &AppId) {
        if self.paused.remove(id).is_some() {
            tracing::info!(app_id = %id, "Resumed delivery for app");
        }
    }

    #[must_use]
    pub fn pause_reason(&self, id: &AppId) -> Option<Error> {
        self.paused.get(id).map(|r| r.value().clone())
    }

    #[must_use]
    pub fn is_paused(&self, id: &AppId) -> bool {
        self.paused.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Registers every app persisted in the store.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be read.
    pub async fn load_from(&self, store: &dyn NotificationStore) -> Result<usize> {
        let apps = store.load_apps().await?;
        let count = apps.len();
        for app in apps {
            self.register(app);
        }
        tracing::info!(count, "Loaded apps from store");
        Ok(count)
    }

    /// Startup contract: delivery for these apps cannot begin unless they are registered.
    ///
    /// # Errors
    /// Returns `Error::Configuration` naming every missing app.
    pub fn require(&self, ids: &[String]) -> Result<()> {
        let missing: Vec<&str> =
            ids.iter().map(String::as_str).filter(|id| !self.apps.contains_key(&AppId::from(*id))).collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(format!("required apps are not registered: {}", missing.join(", "))))
        }
    }
}

/// JSON list of apps written to the store by the pre-warm step.
#[derive(Debug)]
pub struct AppManifest;

impl AppManifest {
    /// # Errors
    /// Returns `Error::Configuration` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Vec<App>> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read apps manifest {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Configuration(format!("invalid apps manifest {}: {e}", path.display())))
    }

    /// Persists every manifest app so all daemons see them at startup.
    ///
    /// # Errors
    /// Returns `Error::Configuration` for a bad manifest or `Error::StoreUnavailable`.
    pub async fn initialize(path: &Path, store: &dyn NotificationStore) -> Result<usize> {
        let apps = Self::load(path)?;
        for app in &apps {
            store.save_app(app).await?;
            tracing::info!(app_id = %app.id, backend = app.backend.as_str(), "Initialized app");
        }
        Ok(apps.len())
    }
}
