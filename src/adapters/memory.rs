use crate::domain::app::{App, AppId};
use crate::domain::notification::{DeliveryFailure, DeliveryProgress, Notification, NotificationState};
use crate::error::{Error, Result};
use crate::storage::NotificationStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug)]
struct Record {
    notification: Notification,
    seq: u64,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<Uuid, Record>,
    apps: HashMap<AppId, App>,
    next_seq: u64,
}

impl Inner {
    fn purge_expired(&mut self, now: Instant) {
        self.records.retain(|_, r| r.expires_at.is_none_or(|at| at > now));
    }

    /// Applies `f` if the record is in one of the `from` states.
    fn transition(
        &mut self,
        id: Uuid,
        from: &[NotificationState],
        f: impl FnOnce(&mut Notification),
    ) -> bool {
        match self.records.get_mut(&id) {
            Some(record) if from.contains(&record.notification.state) => {
                f(&mut record.notification);
                true
            }
            _ => false,
        }
    }
}

/// Process-local store. Used by tests and by `client = memory` for single-node setups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `StoreUnavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of notifications not yet scheduled for removal.
    pub async fn live_count(&self) -> usize {
        self.inner.lock().await.records.values().filter(|r| r.expires_at.is_none()).count()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create(&self, notification: &Notification) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let mut notification = notification.clone();
        notification.state = NotificationState::Pending;
        inner.records.insert(notification.id, Record { notification, seq, expires_at: None });
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());
        Ok(inner.records.get(&id).map(|r| r.notification.clone()))
    }

    async fn enqueue_pending(&self, limit: usize) -> Result<Vec<Notification>> {
        self.check_available()?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock().await;
        inner.purge_expired(Instant::now());

        let mut due: Vec<(OffsetDateTime, u64, Uuid)> = inner
            .records
            .values()
            .filter(|r| r.notification.is_due(now))
            .map(|r| (r.notification.deliver_after.unwrap_or(r.notification.created_at), r.seq, r.notification.id))
            .collect();
        due.sort_unstable();

        let mut claimed = Vec::with_capacity(limit.min(due.len()));
        for (_, _, id) in due.into_iter().take(limit) {
            if let Some(record) = inner.records.get_mut(&id) {
                record.notification.state = NotificationState::Enqueued;
                claimed.push(record.notification.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_sending(&self, id: Uuid) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.transition(id, &[NotificationState::Enqueued], |n| n.state = NotificationState::Sending))
    }

    async fn mark_delivered(&self, id: Uuid, progress: &DeliveryProgress) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.transition(id, &[NotificationState::Sending], |n| {
            n.state = NotificationState::Delivered;
            n.delivered_at = Some(OffsetDateTime::now_utc());
            n.progress = progress.clone();
        }))
    }

    async fn mark_partially_delivered(
        &self,
        id: Uuid,
        failure: &DeliveryFailure,
        progress: &DeliveryProgress,
    ) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.transition(id, &[NotificationState::Sending], |n| {
            n.state = NotificationState::PartiallyDelivered;
            n.delivered_at = Some(OffsetDateTime::now_utc());
            n.error_code = Some(failure.code.clone());
            n.error_description = Some(failure.description.clone());
            n.progress = progress.clone();
        }))
    }

    async fn mark_failed(&self, id: Uuid, failure: &DeliveryFailure, progress: &DeliveryProgress) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.transition(id, &[NotificationState::Sending, NotificationState::Enqueued], |n| {
            n.state = NotificationState::Failed;
            n.failed_at = Some(OffsetDateTime::now_utc());
            n.error_code = Some(failure.code.clone());
            n.error_description = Some(failure.description.clone());
            n.progress = progress.clone();
        }))
    }

    async fn mark_retry(&self, id: Uuid, next_attempt: OffsetDateTime, progress: &DeliveryProgress) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.transition(id, &[NotificationState::Sending], |n| {
            n.state = NotificationState::Retrying;
            n.retries += 1;
            n.deliver_after = Some(next_attempt);
            n.progress = progress.clone();
        }))
    }

    async fn release(&self, id: Uuid, deliver_after: OffsetDateTime) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.transition(id, &[NotificationState::Enqueued, NotificationState::Sending], |n| {
            n.state = NotificationState::Pending;
            n.deliver_after = Some(deliver_after);
        }))
    }

    async fn expire(&self, id: Uuid, ttl: Duration) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        if let Some(record) = inner.records.get_mut(&id) {
            record.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn reclaim_in_flight(&self) -> Result<usize> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let mut reclaimed = 0;
        for record in inner.records.values_mut() {
            if record.notification.state.is_in_flight() {
                record.notification.state = NotificationState::Pending;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn save_app(&self, app: &App) -> Result<()> {
        self.check_available()?;
        self.inner.lock().await.apps.insert(app.id.clone(), app.clone());
        Ok(())
    }

    async fn load_apps(&self) -> Result<Vec<App>> {
        self.check_available()?;
        Ok(self.inner.lock().await.apps.values().cloned().collect())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::notification::{Payload, RecipientFailure};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn notification(token: &str) -> Notification {
        Notification::new(AppId::from("app"), token, Payload::alert("hello"))
    }

    #[tokio::test]
    async fn test_claimed_notifications_are_not_returned_again() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store.create(&notification(&format!("tok{i}"))).await.unwrap();
        }

        let first = store.enqueue_pending(2).await.unwrap();
        let second = store.enqueue_pending(10).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(first.iter().all(|n| n.state == NotificationState::Enqueued));
        assert!(!first.iter().any(|n| n.id == second[0].id));
        assert!(store.enqueue_pending(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_of_150_is_claimed_as_100_then_50() {
        let store = MemoryStore::new();
        for i in 0..150 {
            store.create(&notification(&format!("tok{i}"))).await.unwrap();
        }

        assert_eq!(store.enqueue_pending(100).await.unwrap().len(), 100);
        assert_eq!(store.enqueue_pending(100).await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_overlap() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..200 {
            store.create(&notification(&format!("tok{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.enqueue_pending(30).await.unwrap() }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for n in handle.await.unwrap() {
                assert!(seen.insert(n.id), "notification {} claimed twice", n.id);
            }
        }
        assert_eq!(seen.len(), 200);
    }

    #[tokio::test]
    async fn test_mark_sending_is_exclusive() {
        let store = MemoryStore::new();
        let n = notification("tok");
        store.create(&n).await.unwrap();
        store.enqueue_pending(1).await.unwrap();

        assert!(store.mark_sending(n.id).await.unwrap());
        assert!(!store.mark_sending(n.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_transition_happens_once() {
        let store = MemoryStore::new();
        let n = notification("tok");
        store.create(&n).await.unwrap();
        store.enqueue_pending(1).await.unwrap();
        store.mark_sending(n.id).await.unwrap();

        let progress = DeliveryProgress { delivered_to: vec!["tok".into()], failed_to: vec![] };
        assert!(store.mark_delivered(n.id, &progress).await.unwrap());
        assert!(!store.mark_delivered(n.id, &progress).await.unwrap());
        assert!(!store.mark_failed(n.id, &DeliveryFailure::new("x", "y"), &progress).await.unwrap());

        let stored = store.get(n.id).await.unwrap().unwrap();
        assert_eq!(stored.state, NotificationState::Delivered);
        assert!(stored.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_retrying_notification_is_claimable_only_when_due() {
        let store = MemoryStore::new();
        let n = notification("tok");
        store.create(&n).await.unwrap();
        store.enqueue_pending(1).await.unwrap();
        store.mark_sending(n.id).await.unwrap();

        let next = OffsetDateTime::now_utc() + time::Duration::milliseconds(50);
        assert!(store.mark_retry(n.id, next, &DeliveryProgress::default()).await.unwrap());
        assert!(store.enqueue_pending(10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let claimed = store.enqueue_pending(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].retries, 1);
    }

    #[tokio::test]
    async fn test_partial_delivery_is_terminal() {
        let store = MemoryStore::new();
        let n = Notification::with_recipients(AppId::from("app"), vec!["a".into(), "b".into()], Payload::alert("hi"));
        store.create(&n).await.unwrap();
        store.enqueue_pending(1).await.unwrap();
        store.mark_sending(n.id).await.unwrap();

        let progress = DeliveryProgress {
            delivered_to: vec!["a".into()],
            failed_to: vec![RecipientFailure { token: "b".into(), code: "Unregistered".into(), description: "gone".into() }],
        };
        let failure = DeliveryFailure::new("Unregistered", "gone");
        assert!(store.mark_partially_delivered(n.id, &failure, &progress).await.unwrap());
        assert!(!store.mark_delivered(n.id, &progress).await.unwrap());
        assert!(!store.mark_partially_delivered(n.id, &failure, &progress).await.unwrap());

        let stored = store.get(n.id).await.unwrap().unwrap();
        assert_eq!(stored.state, NotificationState::PartiallyDelivered);
        assert_eq!(stored.error_code.as_deref(), Some("Unregistered"));
        assert!(stored.delivered_at.is_some());
        assert_eq!(stored.progress, progress);
    }

    #[tokio::test]
    async fn test_release_returns_claim_without_counting_an_attempt() {
        let store = MemoryStore::new();
        let n = notification("tok");
        store.create(&n).await.unwrap();
        store.enqueue_pending(1).await.unwrap();

        let later = OffsetDateTime::now_utc() + time::Duration::milliseconds(50);
        assert!(store.release(n.id, later).await.unwrap());
        assert!(!store.release(n.id, later).await.unwrap());
        assert!(store.enqueue_pending(10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let claimed = store.enqueue_pending(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].retries, 0);
    }

    #[tokio::test]
    async fn test_outage_mid_delivery_leaves_claim_for_reclaim() {
        let store = MemoryStore::new();
        let n = notification("tok");
        store.create(&n).await.unwrap();
        store.enqueue_pending(1).await.unwrap();
        store.mark_sending(n.id).await.unwrap();

        store.set_unavailable(true);
        let next = OffsetDateTime::now_utc();
        assert!(store.mark_retry(n.id, next, &DeliveryProgress::default()).await.is_err());
        store.set_unavailable(false);

        // Neither claimable nor lost: the notification waits in `sending` for the next start.
        assert_eq!(store.get(n.id).await.unwrap().unwrap().state, NotificationState::Sending);
        assert!(store.enqueue_pending(10).await.unwrap().is_empty());
        assert_eq!(store.reclaim_in_flight().await.unwrap(), 1);
        assert_eq!(store.enqueue_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reclaim_returns_stranded_notifications() {
        let store = MemoryStore::new();
        let a = notification("a");
        let b = notification("b");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        store.enqueue_pending(2).await.unwrap();
        store.mark_sending(a.id).await.unwrap();

        assert_eq!(store.reclaim_in_flight().await.unwrap(), 2);
        assert_eq!(store.enqueue_pending(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_expire_removes_after_ttl() {
        let store = MemoryStore::new();
        let n = notification("tok");
        store.create(&n).await.unwrap();
        store.expire(n.id, Duration::from_millis(20)).await.unwrap();
        assert_eq!(store.live_count().await, 0);
        assert!(store.get(n.id).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.get(n.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_claims() {
        let store = MemoryStore::new();
        store.create(&notification("tok")).await.unwrap();
        store.set_unavailable(true);
        assert!(matches!(store.enqueue_pending(10).await, Err(Error::StoreUnavailable(_))));

        store.set_unavailable(false);
        assert_eq!(store.enqueue_pending(10).await.unwrap().len(), 1);
    }
}
