use crate::error::{Error, Result};
use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;

pub mod notification_store;

pub use notification_store::RedisNotificationStore;

#[derive(Debug, Clone)]
pub struct RedisClient {
    connection: redis::aio::ConnectionManager,
}

impl RedisClient {
    /// Connects to Redis, retrying the initial connection with exponential backoff.
    /// The returned client reconnects on its own afterwards.
    ///
    /// # Errors
    /// Returns `Error::StoreUnavailable` if the connection cannot be established.
    pub async fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;

        let retry_strategy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(200))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(5);

        let connection = (|| async { client.get_connection_manager().await })
            .retry(&retry_strategy)
            .notify(|e, duration| {
                tracing::warn!(error = %e, "Redis connection failed, retrying in {:?}", duration);
            })
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        tracing::info!("Connected to Redis");
        Ok(Self { connection })
    }

    /// Returns a connection handle. Handles are cheap clones of one multiplexed connection.
    #[must_use]
    pub fn connection(&self) -> redis::aio::ConnectionManager {
        self.connection.clone()
    }

    /// Pings the Redis server to check connectivity.
    ///
    /// # Errors
    /// Returns an error if the ping fails.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}
