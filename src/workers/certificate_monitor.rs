use crate::config::CredentialConfig;
use crate::domain::app::App;
use crate::domain::event::ReflectionEvent;
use crate::error::Error;
use crate::services::app_registry::AppRegistry;
use crate::services::reflection::ReflectionBus;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    /// No expiry, or expiry beyond the warning window.
    Valid,
    ExpiringSoon(OffsetDateTime),
    Expired(OffsetDateTime),
}

#[must_use]
pub fn check_expiry(app: &App, now: OffsetDateTime, window: time::Duration) -> CredentialStatus {
    match app.credential.expires_at {
        Some(at) if at <= now => CredentialStatus::Expired(at),
        Some(at) if at - now <= window => CredentialStatus::ExpiringSoon(at),
        _ => CredentialStatus::Valid,
    }
}

/// Periodically warns about credentials nearing expiry and pauses apps whose credential
/// has already expired.
#[derive(Debug)]
pub struct CertificateMonitor {
    registry: Arc<AppRegistry>,
    bus: ReflectionBus,
    interval: Duration,
    window: time::Duration,
}

impl CertificateMonitor {
    #[must_use]
    pub fn new(registry: Arc<AppRegistry>, bus: ReflectionBus, config: &CredentialConfig) -> Self {
        Self {
            registry,
            bus,
            interval: Duration::from_secs(config.cert_check_interval_secs),
            window: time::Duration::days(config.cert_warning_days),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    tracing::debug_span!("certificate_check").in_scope(|| self.check_all(OffsetDateTime::now_utc()));
                }
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!("Certificate monitor shutting down...");
    }

    /// Checks every registered app once. Returns how many apps needed attention.
    ///
    /// An expired credential pauses its app and is reported once; later checks stay quiet
    /// until the credential is rotated.
    pub fn check_all(&self, now: OffsetDateTime) -> usize {
        let mut flagged = 0;
        for app in self.registry.all() {
            match check_expiry(&app, now, self.window) {
                CredentialStatus::Valid => {}
                CredentialStatus::ExpiringSoon(expires_at) => {
                    flagged += 1;
                    self.bus.emit(ReflectionEvent::CertificateWillExpire { app_id: app.id.clone(), expires_at });
                }
                CredentialStatus::Expired(expires_at) => {
                    flagged += 1;
                    if matches!(self.registry.pause_reason(&app.id), Some(Error::CredentialExpired(_))) {
                        continue;
                    }
                    let error = Error::CredentialExpired(format!("credential for app {} expired at {expires_at}", app.id));
                    self.registry.pause(&app.id, error.clone());
                    self.bus.error(Some(app.id.clone()), error);
                }
            }
        }
        tracing::debug!(apps = self.registry.len(), flagged, "Checked app credentials");
        flagged
    }
}
