use crate::adapters::memory::MemoryStore;
use crate::adapters::redis::{RedisClient, RedisNotificationStore};
use crate::config::{StoreClient, StoreConfig};
use crate::domain::app::App;
use crate::domain::notification::{DeliveryFailure, DeliveryProgress, Notification};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Durable record of notifications and their delivery state.
///
/// Claiming is atomic: a notification returned by `enqueue_pending` is invisible to every
/// other caller until it is settled by `mark_delivered`, `mark_partially_delivered`,
/// `mark_failed`, `mark_retry` or `release`.
/// Every state transition is a compare-and-swap and reports whether this caller performed it.
///
/// A transition and the queue change that goes with it (leaving or re-entering the due
/// queue) happen together or not at all. A store error therefore leaves a notification in
/// its previous state: still due if it was never claimed, or `enqueued`/`sending` if it
/// was, which `reclaim_in_flight` returns to `pending` on the next start.
#[async_trait]
pub trait NotificationStore: Send + Sync + std::fmt::Debug {
    /// Persists a new pending notification.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn create(&self, notification: &Notification) -> Result<()>;

    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn get(&self, id: Uuid) -> Result<Option<Notification>>;

    /// Claims at most `limit` due notifications and returns them in claim order.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable`; in that case nothing may be assumed claimed.
    async fn enqueue_pending(&self, limit: usize) -> Result<Vec<Notification>>;

    /// Moves a claimed notification to `sending`. Returns `false` if another caller owns it.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn mark_sending(&self, id: Uuid) -> Result<bool>;

    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn mark_delivered(&self, id: Uuid, progress: &DeliveryProgress) -> Result<bool>;

    /// Settles a fan-out where some recipients accepted and the rest failed permanently.
    /// `failure` is the first permanent recipient failure.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn mark_partially_delivered(
        &self,
        id: Uuid,
        failure: &DeliveryFailure,
        progress: &DeliveryProgress,
    ) -> Result<bool>;

    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn mark_failed(&self, id: Uuid, failure: &DeliveryFailure, progress: &DeliveryProgress) -> Result<bool>;

    /// Moves a sending notification to `retrying`, bumping its retry count.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn mark_retry(&self, id: Uuid, next_attempt: OffsetDateTime, progress: &DeliveryProgress) -> Result<bool>;

    /// Hands a claimed notification back to the due queue at `deliver_after` without
    /// counting an attempt. Used while its app is paused.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn release(&self, id: Uuid, deliver_after: OffsetDateTime) -> Result<bool>;

    /// Schedules removal of a notification after `ttl`.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn expire(&self, id: Uuid, ttl: Duration) -> Result<()>;

    /// Returns notifications stranded in `enqueued` or `sending` to `pending`.
    /// Only safe to call before any worker of this deployment starts claiming.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn reclaim_in_flight(&self) -> Result<usize>;

    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn save_app(&self, app: &App) -> Result<()>;

    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn load_apps(&self) -> Result<Vec<App>>;

    /// # Errors
    /// Returns `Error::StoreUnavailable` if the store cannot be reached.
    async fn ping(&self) -> Result<()>;
}

/// Opens the store selected by `config.client`.
///
/// # Errors
/// Returns `Error::StoreUnavailable` if the backing service cannot be reached.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn NotificationStore>> {
    match config.client {
        StoreClient::Memory => {
            tracing::warn!("Using the in-memory notification store; state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreClient::Redis => {
            let client = RedisClient::new(&config.redis_url).await?;
            Ok(Arc::new(RedisNotificationStore::new(client, config.key_prefix.clone())))
        }
    }
}

pub(crate) fn unix_millis(at: OffsetDateTime) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let millis = (at.unix_timestamp_nanos() / 1_000_000) as f64;
    millis
}
