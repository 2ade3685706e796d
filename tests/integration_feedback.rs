mod common;

use common::{Script, ScriptedBackend};
use push_relay::adapters::backend::Backends;
use push_relay::domain::app::{AppId, BackendKind, Credential, CredentialMaterial};
use push_relay::domain::event::{EventKind, ReflectionEvent};
use push_relay::domain::feedback::FeedbackReason;
use push_relay::domain::notification::{Notification, NotificationState, Payload};
use push_relay::error::Error;
use push_relay::storage::NotificationStore;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;

#[tokio::test]
async fn test_unregistered_token_is_fed_back_exactly_once() {
    let fcm = Arc::new(ScriptedBackend::new(BackendKind::Fcm));
    fcm.always("stale", Script::Reject("Unregistered"));

    let t = common::build_engine(
        common::get_test_config(),
        &[common::test_app("android", BackendKind::Fcm, "b")],
        Backends::new().with(Arc::clone(&fcm) as _),
    )
    .await;
    let id = common::submit(&t.engine, "android", "stale").await;

    let recorder = Arc::clone(&t.recorder);
    let store = Arc::clone(&t.store);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(t.engine.run(shutdown_rx));

    assert!(
        common::wait_until(Duration::from_secs(5), || async { recorder.count(EventKind::Feedback) == 1 }).await
    );
    // Give a duplicate the chance to show up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let feedback = recorder.of_kind(EventKind::Feedback);
    assert_eq!(feedback.len(), 1);
    assert!(matches!(
        &feedback[0],
        ReflectionEvent::Feedback { app_id, device_token, reason: FeedbackReason::Unregistered }
            if app_id.as_str() == "android" && device_token == "stale"
    ));
    assert_eq!(common::state_of(&store, id).await, Some(NotificationState::Failed));
    assert_eq!(fcm.sent_to("stale"), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_mixed_fan_out_is_partially_delivered_with_per_recipient_events() {
    let fcm = Arc::new(ScriptedBackend::new(BackendKind::Fcm));
    fcm.always("gone", Script::Reject("Unregistered"));

    let t = common::build_engine(
        common::get_test_config(),
        &[common::test_app("android", BackendKind::Fcm, "b")],
        Backends::new().with(Arc::clone(&fcm) as _),
    )
    .await;

    let notification = Notification::with_recipients(
        AppId::from("android"),
        vec!["one".into(), "gone".into(), "two".into()],
        Payload::alert("group message"),
    );
    t.engine.submit(&notification).await.unwrap();
    t.engine.workers.poller.poll_once().await.unwrap();

    let store = Arc::clone(&t.store);
    assert!(
        common::wait_until(Duration::from_secs(5), || async {
            common::state_of(&store, notification.id).await == Some(NotificationState::PartiallyDelivered)
        })
        .await
    );

    assert_eq!(t.recorder.count(EventKind::DeliveredToRecipient), 2);
    let failed = t.recorder.of_kind(EventKind::FailedToRecipient);
    assert_eq!(failed.len(), 1);
    assert!(matches!(
        &failed[0],
        ReflectionEvent::FailedToRecipient { token, error_code, .. } if token == "gone" && error_code == "Unregistered"
    ));

    assert_eq!(t.recorder.count(EventKind::NotificationDelivered), 0);
    assert_eq!(t.recorder.count(EventKind::NotificationFailed), 0);
    let partial = t.recorder.of_kind(EventKind::NotificationPartiallyDelivered);
    let [ReflectionEvent::NotificationPartiallyDelivered(event)] = partial.as_slice() else {
        panic!("expected exactly one partial delivery event, got {partial:?}");
    };
    assert_eq!(event.delivered_to, vec!["one", "two"]);
    assert_eq!(event.failed_to, vec!["gone"]);

    let stored = t.store.get(notification.id).await.unwrap().unwrap();
    assert_eq!(stored.progress.delivered_to, vec!["one", "two"]);
    assert_eq!(stored.progress.failed_to.len(), 1);
}

#[tokio::test]
async fn test_fan_out_accepted_by_everyone_is_delivered() {
    let fcm = Arc::new(ScriptedBackend::new(BackendKind::Fcm));
    let t = common::build_engine(
        common::get_test_config(),
        &[common::test_app("android", BackendKind::Fcm, "b")],
        Backends::new().with(Arc::clone(&fcm) as _),
    )
    .await;

    let notification = Notification::with_recipients(
        AppId::from("android"),
        vec!["one".into(), "two".into()],
        Payload::alert("group message"),
    );
    t.engine.submit(&notification).await.unwrap();
    t.engine.workers.poller.poll_once().await.unwrap();

    let store = Arc::clone(&t.store);
    assert!(
        common::wait_until(Duration::from_secs(5), || async {
            common::state_of(&store, notification.id).await == Some(NotificationState::Delivered)
        })
        .await
    );
    let delivered = t.recorder.of_kind(EventKind::NotificationDelivered);
    let [ReflectionEvent::NotificationDelivered(event)] = delivered.as_slice() else {
        panic!("expected exactly one delivery event, got {delivered:?}");
    };
    assert_eq!(event.device_tokens, vec!["one", "two"]);
    assert_eq!(event.payload_summary, "group message");
}

#[tokio::test]
async fn test_superseded_token_is_reported_as_canonical_id() {
    let fcm = Arc::new(ScriptedBackend::new(BackendKind::Fcm));
    fcm.script("stale-reg", [Script::Canonical("fresh-reg")]);

    let t = common::build_engine(
        common::get_test_config(),
        &[common::test_app("android", BackendKind::Fcm, "b")],
        Backends::new().with(Arc::clone(&fcm) as _),
    )
    .await;
    let id = common::submit(&t.engine, "android", "stale-reg").await;
    t.engine.workers.poller.poll_once().await.unwrap();

    let store = Arc::clone(&t.store);
    assert!(
        common::wait_until(Duration::from_secs(5), || async {
            common::state_of(&store, id).await == Some(NotificationState::Delivered)
        })
        .await
    );
    let canonical = t.recorder.of_kind(EventKind::CanonicalId);
    assert!(matches!(
        &canonical[..],
        [ReflectionEvent::CanonicalId { app_id, old_token, new_token }]
            if app_id.as_str() == "android" && old_token == "stale-reg" && new_token == "fresh-reg"
    ));
    assert_eq!(t.recorder.count(EventKind::Feedback), 0);
}

#[tokio::test]
async fn test_paused_app_claims_stay_pending() {
    let fcm = Arc::new(ScriptedBackend::new(BackendKind::Fcm));
    let t = common::build_engine(
        common::get_test_config(),
        &[common::test_app("android", BackendKind::Fcm, "b")],
        Backends::new().with(Arc::clone(&fcm) as _),
    )
    .await;
    let app_id = AppId::from("android");
    t.engine.registry.pause(&app_id, Error::CredentialExpired("expired".into()));

    let id = common::submit(&t.engine, "android", "tok").await;
    assert_eq!(t.engine.workers.poller.poll_once().await.unwrap(), 1);

    let stored = t.store.get(id).await.unwrap().unwrap();
    assert_eq!(stored.state, NotificationState::Pending);
    assert_eq!(stored.retries, 0);
    assert!(stored.deliver_after.is_some_and(|at| at > OffsetDateTime::now_utc()));
    assert!(!t.engine.runners.contains(&app_id));
    assert_eq!(fcm.sent_to("tok"), 0);
    assert_eq!(t.recorder.count(EventKind::NotificationFailed), 0);

    // Not due again until the deferral passes.
    assert_eq!(t.engine.workers.poller.poll_once().await.unwrap(), 0);

    t.engine.registry.resume(&app_id);
    let store = Arc::clone(&t.store);
    let poller = &t.engine.workers.poller;
    assert!(
        common::wait_until(Duration::from_secs(5), || async {
            let _ = poller.poll_once().await;
            common::state_of(&store, id).await == Some(NotificationState::Delivered)
        })
        .await
    );
    assert_eq!(fcm.sent_to("tok"), 1);
}

#[tokio::test]
async fn test_revoked_credential_pauses_app_until_rotation() {
    let apns = Arc::new(ScriptedBackend::new(BackendKind::Apns).serial());
    apns.script("first", [Script::Revoke]);

    let t = common::build_engine(
        common::get_test_config(),
        &[common::test_app("ios", BackendKind::Apns, "old-key")],
        Backends::new().with(Arc::clone(&apns) as _),
    )
    .await;
    let app_id = AppId::from("ios");

    let first = common::submit(&t.engine, "ios", "first").await;
    let queued = common::submit(&t.engine, "ios", "second").await;
    t.engine.workers.poller.poll_once().await.unwrap();

    let runners = Arc::clone(&t.engine.runners);
    assert!(common::wait_until(Duration::from_secs(5), || async { runners.total_queued() == 0 }).await);

    assert!(t.engine.registry.is_paused(&app_id));
    let stored = t.store.get(first).await.unwrap().unwrap();
    assert_eq!(stored.state, NotificationState::Failed);
    assert_eq!(stored.error_code.as_deref(), Some("credential_revoked"));
    // Work queued behind the revoked send waits for new credentials instead of failing.
    let stored = t.store.get(queued).await.unwrap().unwrap();
    assert_eq!(stored.state, NotificationState::Pending);
    assert!(stored.error_code.is_none());
    assert_eq!(apns.sent_to("second"), 0);

    // The feedback worker turns the revocation into an ssl_certificate_revoked event.
    let recorder = Arc::clone(&t.recorder);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = t.engine;
    let registry = Arc::clone(&engine.registry);
    let store = Arc::clone(&t.store);
    let run = tokio::spawn(engine.run(shutdown_rx));
    assert!(
        common::wait_until(Duration::from_secs(5), || async {
            recorder.count(EventKind::CertificateRevoked) == 1
        })
        .await
    );

    // Rotating the credential resumes delivery on a fresh connection.
    let connects_before = apns.connects();
    let rotated_app = common::test_app("ios", BackendKind::Apns, "new-key");
    registry.save(store.as_ref(), rotated_app.clone()).await.unwrap();
    assert!(!registry.is_paused(&app_id));
    let persisted = store.load_apps().await.unwrap();
    assert_eq!(persisted.iter().find(|a| a.id == app_id).map(|a| &a.credential), Some(&rotated_app.credential));

    let rotated = Notification::new(app_id.clone(), "third", Payload::alert("after rotation"));
    store.create(&rotated).await.unwrap();
    assert!(
        common::wait_until(Duration::from_secs(5), || async {
            common::state_of(&store, rotated.id).await == Some(NotificationState::Delivered)
                && common::state_of(&store, queued).await == Some(NotificationState::Delivered)
        })
        .await
    );
    assert_eq!(apns.connects(), connects_before + 1);
    assert_eq!(apns.sent_to("second"), 1);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_certificate_expiring_within_window_is_announced() {
    let now = OffsetDateTime::now_utc();
    let mut expiring = common::test_app("ios", BackendKind::Apns, "k");
    expiring.credential = Credential {
        material: CredentialMaterial::Certificate { pem: "-----BEGIN CERTIFICATE-----".into() },
        expires_at: Some(now + time::Duration::days(20)),
    };
    let apns = Arc::new(ScriptedBackend::new(BackendKind::Apns));

    let t = common::build_engine(common::get_test_config(), &[expiring], Backends::new().with(apns as _)).await;

    assert_eq!(t.engine.workers.certificate_monitor.check_all(now), 1);
    let events = t.recorder.of_kind(EventKind::CertificateWillExpire);
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        ReflectionEvent::CertificateWillExpire { app_id, expires_at }
            if app_id.as_str() == "ios" && *expires_at == now + time::Duration::days(20)
    ));
    assert!(!t.engine.registry.is_paused(&AppId::from("ios")));
}
