use crate::adapters::redis::RedisClient;
use crate::domain::app::App;
use crate::domain::notification::{DeliveryFailure, DeliveryProgress, Notification, NotificationState};
use crate::error::Result;
use crate::storage::{NotificationStore, unix_millis};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Compare-and-set of one notification, applied atomically with its due-queue change.
///
/// KEYS: state hash, document, pending zset.
/// ARGV: id, new state, expected document, new document, queue op (`keep`, `claim` or
/// `schedule`), score, then the states the notification may currently be in.
///
/// Returns 1 when applied. Returns 0 without writing when the state or the document moved
/// under the caller, or when a `claim` lost the race for the zset entry.
const TRANSITION_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], ARGV[1])
local allowed = false
for i = 7, #ARGV do
  if current == ARGV[i] then
    allowed = true
    break
  end
end
if not allowed then
  return 0
end
if redis.call('GET', KEYS[2]) ~= ARGV[3] then
  return 0
end
if ARGV[5] == 'claim' and redis.call('ZREM', KEYS[3], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('SET', KEYS[2], ARGV[4])
if ARGV[5] == 'schedule' then
  redis.call('ZADD', KEYS[3], ARGV[6], ARGV[1])
end
return 1
";

const fn state_name(state: NotificationState) -> &'static str {
    match state {
        NotificationState::Pending => "pending",
        NotificationState::Enqueued => "enqueued",
        NotificationState::Sending => "sending",
        NotificationState::Delivered => "delivered",
        NotificationState::Failed => "failed",
        NotificationState::Retrying => "retrying",
        NotificationState::PartiallyDelivered => "partially_delivered",
    }
}

/// What a transition does to the pending zset.
#[derive(Debug, Clone, Copy)]
enum QueueOp {
    Keep,
    /// Removes the id; the transition is abandoned if another caller removed it first.
    Claim,
    Schedule(OffsetDateTime),
}

impl QueueOp {
    const fn name(self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Claim => "claim",
            Self::Schedule(_) => "schedule",
        }
    }

    fn score(self) -> f64 {
        match self {
            Self::Schedule(at) => unix_millis(at),
            Self::Keep | Self::Claim => 0.0,
        }
    }
}

/// Redis layout:
/// - `{prefix}:notification:{id}`: JSON document
/// - `{prefix}:state`: hash of id to state, the authority for transitions
/// - `{prefix}:pending`: sorted set of due ids, scored by next attempt (unix ms)
/// - `{prefix}:all`: set of live ids
/// - `{prefix}:apps`: hash of app id to JSON app
#[derive(Debug, Clone)]
pub struct RedisNotificationStore {
    redis: RedisClient,
    prefix: String,
    transition: redis::Script,
}

impl RedisNotificationStore {
    #[must_use]
    pub fn new(redis: RedisClient, prefix: String) -> Self {
        Self { redis, prefix, transition: redis::Script::new(TRANSITION_SCRIPT) }
    }

    fn doc_key(&self, id: Uuid) -> String {
        format!("{}:notification:{id}", self.prefix)
    }

    fn state_key(&self) -> String {
        format!("{}:state", self.prefix)
    }

    fn pending_key(&self) -> String {
        format!("{}:pending", self.prefix)
    }

    fn all_key(&self) -> String {
        format!("{}:all", self.prefix)
    }

    fn apps_key(&self) -> String {
        format!("{}:apps", self.prefix)
    }

    async fn load_raw(&self, id: Uuid) -> Result<Option<String>> {
        let mut conn = self.redis.connection();
        Ok(conn.get(self.doc_key(id)).await?)
    }

    async fn load(&self, id: Uuid) -> Result<Option<Notification>> {
        let doc = self.load_raw(id).await?;
        doc.map(|d| serde_json::from_str(&d)).transpose().map_err(Into::into)
    }

    /// Applies `update` to the stored document and moves it to `to`, if it is in one of the
    /// `from` states and nobody rewrote it in between. State, document and queue change land
    /// in one script call.
    async fn transition_and_update(
        &self,
        id: Uuid,
        from: &[NotificationState],
        to: NotificationState,
        queue: QueueOp,
        update: impl FnOnce(&mut Notification) + Send,
    ) -> Result<Option<Notification>> {
        let Some(current) = self.load_raw(id).await? else {
            return Ok(None);
        };
        let mut notification: Notification = serde_json::from_str(&current)?;
        if !from.contains(&notification.state) {
            return Ok(None);
        }
        notification.state = to;
        update(&mut notification);
        let doc = serde_json::to_string(&notification)?;

        let mut conn = self.redis.connection();
        let mut invocation = self.transition.key(self.state_key());
        invocation
            .key(self.doc_key(id))
            .key(self.pending_key())
            .arg(id.to_string())
            .arg(state_name(to))
            .arg(current)
            .arg(doc)
            .arg(queue.name())
            .arg(queue.score());
        for state in from {
            invocation.arg(state_name(*state));
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok((applied == 1).then_some(notification))
    }
}

#[async_trait]
impl NotificationStore for RedisNotificationStore {
    #[tracing::instrument(level = "debug", skip_all, fields(notification_id = %notification.id))]
    async fn create(&self, notification: &Notification) -> Result<()> {
        let mut notification = notification.clone();
        notification.state = NotificationState::Pending;
        let id = notification.id.to_string();
        let due = unix_millis(notification.deliver_after.unwrap_or(notification.created_at));

        let mut conn = self.redis.connection();
        let () = redis::pipe()
            .atomic()
            .set(self.doc_key(notification.id), serde_json::to_string(&notification)?)
            .ignore()
            .hset(self.state_key(), &id, state_name(notification.state))
            .ignore()
            .sadd(self.all_key(), &id)
            .ignore()
            .zadd(self.pending_key(), &id, due)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        self.load(id).await
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn enqueue_pending(&self, limit: usize) -> Result<Vec<Notification>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = unix_millis(OffsetDateTime::now_utc());
        let mut conn = self.redis.connection();

        // 1. Read candidates
        let candidates: Vec<String> = conn
            .zrangebyscore_limit(self.pending_key(), "-inf", now, 0, isize::try_from(limit).unwrap_or(isize::MAX))
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());

        // 2. Claim candidates one by one; losing a race just skips the id
        for member in candidates {
            let Ok(id) = Uuid::parse_str(&member) else {
                tracing::warn!(member = %member, "Dropping malformed id from pending queue");
                let _: i64 = conn.zrem(self.pending_key(), &member).await?;
                continue;
            };
            let claim = self
                .transition_and_update(
                    id,
                    &[NotificationState::Pending, NotificationState::Retrying],
                    NotificationState::Enqueued,
                    QueueOp::Claim,
                    |_| {},
                )
                .await?;
            if let Some(notification) = claim {
                claimed.push(notification);
                continue;
            }
            let exists: bool = conn.exists(self.doc_key(id)).await?;
            if !exists {
                tracing::warn!(notification_id = %id, "Dropping pending id without document");
                let _: i64 = conn.zrem(self.pending_key(), &member).await?;
            }
        }

        Ok(claimed)
    }

    async fn mark_sending(&self, id: Uuid) -> Result<bool> {
        Ok(self
            .transition_and_update(id, &[NotificationState::Enqueued], NotificationState::Sending, QueueOp::Keep, |_| {})
            .await?
            .is_some())
    }

    async fn mark_delivered(&self, id: Uuid, progress: &DeliveryProgress) -> Result<bool> {
        let progress = progress.clone();
        Ok(self
            .transition_and_update(
                id,
                &[NotificationState::Sending],
                NotificationState::Delivered,
                QueueOp::Keep,
                move |n| {
                    n.delivered_at = Some(OffsetDateTime::now_utc());
                    n.progress = progress;
                },
            )
            .await?
            .is_some())
    }

    async fn mark_partially_delivered(
        &self,
        id: Uuid,
        failure: &DeliveryFailure,
        progress: &DeliveryProgress,
    ) -> Result<bool> {
        let failure = failure.clone();
        let progress = progress.clone();
        Ok(self
            .transition_and_update(
                id,
                &[NotificationState::Sending],
                NotificationState::PartiallyDelivered,
                QueueOp::Keep,
                move |n| {
                    n.delivered_at = Some(OffsetDateTime::now_utc());
                    n.error_code = Some(failure.code);
                    n.error_description = Some(failure.description);
                    n.progress = progress;
                },
            )
            .await?
            .is_some())
    }

    async fn mark_failed(&self, id: Uuid, failure: &DeliveryFailure, progress: &DeliveryProgress) -> Result<bool> {
        let failure = failure.clone();
        let progress = progress.clone();
        Ok(self
            .transition_and_update(
                id,
                &[NotificationState::Sending, NotificationState::Enqueued],
                NotificationState::Failed,
                QueueOp::Keep,
                move |n| {
                    n.failed_at = Some(OffsetDateTime::now_utc());
                    n.error_code = Some(failure.code);
                    n.error_description = Some(failure.description);
                    n.progress = progress;
                },
            )
            .await?
            .is_some())
    }

    async fn mark_retry(&self, id: Uuid, next_attempt: OffsetDateTime, progress: &DeliveryProgress) -> Result<bool> {
        let progress = progress.clone();
        Ok(self
            .transition_and_update(
                id,
                &[NotificationState::Sending],
                NotificationState::Retrying,
                QueueOp::Schedule(next_attempt),
                move |n| {
                    n.retries += 1;
                    n.deliver_after = Some(next_attempt);
                    n.progress = progress;
                },
            )
            .await?
            .is_some())
    }

    async fn release(&self, id: Uuid, deliver_after: OffsetDateTime) -> Result<bool> {
        Ok(self
            .transition_and_update(
                id,
                &[NotificationState::Enqueued, NotificationState::Sending],
                NotificationState::Pending,
                QueueOp::Schedule(deliver_after),
                move |n| n.deliver_after = Some(deliver_after),
            )
            .await?
            .is_some())
    }

    async fn expire(&self, id: Uuid, ttl: Duration) -> Result<()> {
        let mut conn = self.redis.connection();
        let secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);
        let () = redis::pipe()
            .atomic()
            .expire(self.doc_key(id), secs)
            .ignore()
            .srem(self.all_key(), id.to_string())
            .ignore()
            .hdel(self.state_key(), id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn reclaim_in_flight(&self) -> Result<usize> {
        let mut conn = self.redis.connection();
        let states: Vec<(String, String)> = conn.hgetall(self.state_key()).await?;

        let mut reclaimed = 0;
        for (member, state) in states {
            if state != state_name(NotificationState::Enqueued) && state != state_name(NotificationState::Sending) {
                continue;
            }
            let Ok(id) = Uuid::parse_str(&member) else { continue };
            if self
                .transition_and_update(
                    id,
                    &[NotificationState::Enqueued, NotificationState::Sending],
                    NotificationState::Pending,
                    QueueOp::Schedule(OffsetDateTime::now_utc()),
                    |_| {},
                )
                .await?
                .is_some()
            {
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn save_app(&self, app: &App) -> Result<()> {
        let mut conn = self.redis.connection();
        let doc = serde_json::to_string(app)?;
        let _: i64 = conn.hset(self.apps_key(), app.id.as_str(), doc).await?;
        Ok(())
    }

    async fn load_apps(&self) -> Result<Vec<App>> {
        let mut conn = self.redis.connection();
        let docs: Vec<String> = conn.hvals(self.apps_key()).await?;
        docs.iter().map(|d| serde_json::from_str(d).map_err(Into::into)).collect()
    }

    async fn ping(&self) -> Result<()> {
        self.redis.ping().await
    }
}
