use prediction_state::{
    predictions::{
        PredictionErrorKind, PredictionStore, PredictionStoreConfig, PredictionUpdate,
        RequestStatus,
    },
    service::ServiceError,
    testing::ScriptedPredictionService,
};

use crate::{entry, map, store_for, wait_for_state};

#[tokio::test]
async fn given_same_vendor_when_scope_set_again_then_nothing_is_resubscribed() {
    let service = ScriptedPredictionService::new();
    service.push_batch(Ok(map(&[("x", 1)])));
    let store = store_for(&service, "v1").await;
    store.fetch_batch(["x"]).await.expect("batch should run");

    store.set_scope("v1").await.expect("same scope is a no-op");

    assert_eq!(service.calls().subscribes, vec!["v1".to_string()]);
    assert_eq!(service.live_feeds("v1"), 1);
    let snapshot = store.snapshot();
    assert_eq!(snapshot.status, RequestStatus::Ready);
    assert_eq!(*snapshot.predictions, map(&[("x", 1)]));
}

#[tokio::test]
async fn given_new_vendor_when_scope_changes_then_old_feed_is_released_and_state_reset() {
    let service = ScriptedPredictionService::new();
    service.push_batch(Ok(map(&[("x", 1)])));
    let store = store_for(&service, "a").await;
    store.fetch_batch(["x"]).await.expect("batch should run");

    store.set_scope("b").await.expect("scope should change");

    assert_eq!(service.live_feeds("a"), 0);
    assert_eq!(service.live_feeds("b"), 1);
    assert!(store.has_live_subscription());
    let snapshot = store.snapshot();
    assert_eq!(snapshot.vendor_id.as_deref(), Some("b"));
    assert_eq!(snapshot.status, RequestStatus::Idle);
    assert!(snapshot.predictions.is_empty());
    assert_eq!(snapshot.last_error, None);
}

#[tokio::test]
async fn given_retaining_config_when_scope_changes_then_previous_entries_stay_until_replaced() {
    let service = ScriptedPredictionService::new();
    service.push_batch(Ok(map(&[("x", 1)])));
    service.push_batch(Ok(map(&[("y", 2)])));
    let config = PredictionStoreConfig {
        clear_on_scope_change: false,
    };
    let store = PredictionStore::for_vendor(service.clone(), config, "a")
        .await
        .expect("scope should open");
    store.fetch_batch(["x"]).await.expect("batch should run");

    store.set_scope("b").await.expect("scope should change");
    assert_eq!(*store.snapshot().predictions, map(&[("x", 1)]));
    assert_eq!(store.snapshot().status, RequestStatus::Idle);

    store.fetch_batch(["y"]).await.expect("batch should run");
    assert_eq!(*store.snapshot().predictions, map(&[("y", 2)]));
}

#[tokio::test]
async fn given_batch_in_flight_when_scope_changes_then_late_response_is_discarded() {
    let service = ScriptedPredictionService::new();
    let store = store_for(&service, "a").await;
    let gate = service.push_gated_batch();
    let task = tokio::spawn({
        let store = store.clone();
        async move { store.fetch_batch(["x"]).await }
    });
    service.wait_for_calls(|calls| calls.batches.len() == 1).await;

    store.set_scope("b").await.expect("scope should change");
    gate.send(Ok(map(&[("x", 1)]))).expect("batch should be waiting");
    task.await.expect("task should join").expect("stale batch is dropped quietly");

    let snapshot = store.snapshot();
    assert_eq!(snapshot.vendor_id.as_deref(), Some("b"));
    assert!(snapshot.predictions.is_empty());
    assert_eq!(snapshot.status, RequestStatus::Idle);
}

#[tokio::test]
async fn given_failed_batch_in_flight_when_scope_changes_then_late_failure_is_discarded() {
    let service = ScriptedPredictionService::new();
    let store = store_for(&service, "a").await;
    let gate = service.push_gated_batch();
    let task = tokio::spawn({
        let store = store.clone();
        async move { store.fetch_batch(["x"]).await }
    });
    service.wait_for_calls(|calls| calls.batches.len() == 1).await;

    store.set_scope("b").await.expect("scope should change");
    gate.send(Err(ServiceError::Transport("timeout".to_string())))
        .expect("batch should be waiting");
    task.await.expect("task should join").expect("stale batch is dropped quietly");

    let snapshot = store.snapshot();
    assert_eq!(snapshot.status, RequestStatus::Idle);
    assert_eq!(snapshot.last_error, None);
}

#[tokio::test]
async fn given_single_fetch_in_flight_when_scope_changes_then_caller_sees_scope_changed() {
    let service = ScriptedPredictionService::new();
    let store = store_for(&service, "a").await;
    let gate = service.push_gated_estimate();
    let task = tokio::spawn({
        let store = store.clone();
        async move { store.fetch_one("x").await }
    });
    service
        .wait_for_calls(|calls| calls.quick_estimates.len() == 1)
        .await;

    store.set_scope("b").await.expect("scope should change");
    gate.send(Ok(entry(5))).expect("estimate should be waiting");
    let err = task
        .await
        .expect("task should join")
        .expect_err("late estimate should be rejected");

    assert_eq!(err.kind, PredictionErrorKind::ScopeChanged);
    assert!(store.snapshot().predictions.is_empty());
}

#[tokio::test]
async fn given_pending_subscribe_when_scope_changes_then_late_feed_is_released() {
    let service = ScriptedPredictionService::new();
    let store = PredictionStore::new(service.clone(), PredictionStoreConfig::default());
    let hold = service.hold_next_subscribe();
    let task = tokio::spawn({
        let store = store.clone();
        async move { store.set_scope("a").await }
    });
    service.wait_for_calls(|calls| calls.subscribes.len() == 1).await;

    store.set_scope("b").await.expect("scope should change");
    hold.send(()).expect("subscribe should be waiting");
    task.await.expect("task should join").expect("superseded scope is not an error");

    assert_eq!(service.live_feeds("a"), 0);
    assert_eq!(service.live_feeds("b"), 1);
    assert_eq!(store.vendor_id().as_deref(), Some("b"));
    assert!(store.has_live_subscription());
}

#[tokio::test]
async fn given_subscribe_failure_when_scope_set_then_error_is_returned_and_scope_is_active() {
    let service = ScriptedPredictionService::new();
    service.fail_next_subscribe(ServiceError::Unavailable("feed down".to_string()));
    service.push_batch(Ok(map(&[("x", 1)])));
    let store = PredictionStore::new(service.clone(), PredictionStoreConfig::default());

    let err = store.set_scope("a").await.expect_err("subscribe should fail");

    assert_eq!(err.kind, PredictionErrorKind::Service);
    assert!(!store.has_live_subscription());
    let snapshot = store.snapshot();
    assert_eq!(snapshot.vendor_id.as_deref(), Some("a"));
    assert!(snapshot.last_error.is_some_and(|err| err.contains("feed down")));

    store.fetch_batch(["x"]).await.expect("fetches still work without a feed");
    assert_eq!(*store.snapshot().predictions, map(&[("x", 1)]));
}

#[tokio::test]
async fn given_blank_vendor_when_scope_set_then_invalid_scope_is_returned() {
    let service = ScriptedPredictionService::new();
    let store = PredictionStore::new(service.clone(), PredictionStoreConfig::default());

    let err = store.set_scope(" ").await.expect_err("blank vendor");

    assert_eq!(err.kind, PredictionErrorKind::InvalidScope);
    assert!(service.calls().subscribes.is_empty());
}

#[tokio::test]
async fn given_active_scope_when_cleared_then_feed_is_released_and_fetches_need_a_scope() {
    let service = ScriptedPredictionService::new();
    let store = store_for(&service, "a").await;
    store.on_push_update("x", entry(1)).expect("push should merge");

    store.clear_scope().expect("scope should clear");

    assert_eq!(service.live_feeds("a"), 0);
    assert_eq!(store.vendor_id(), None);
    assert!(store.snapshot().predictions.is_empty());
    let err = store.fetch_batch(["x"]).await.expect_err("no scope");
    assert_eq!(err.kind, PredictionErrorKind::InvalidScope);
}

#[tokio::test]
async fn given_update_queued_on_old_feed_when_scope_changes_then_it_never_reaches_the_map() {
    let service = ScriptedPredictionService::new();
    let config = PredictionStoreConfig {
        clear_on_scope_change: false,
    };
    let store = PredictionStore::for_vendor(service.clone(), config, "a")
        .await
        .expect("scope should open");
    store.on_push_update("kept", entry(1)).expect("push should merge");

    store.set_scope("b").await.expect("scope should change");
    // The old pump has not run yet on this runtime, so its channel is still open.
    let delivered =
        service.push_update_ignoring_release("a", PredictionUpdate::new("stale", entry(9)));
    assert_eq!(delivered, 1);
    service.push_update("b", PredictionUpdate::new("fresh", entry(2)));

    let snapshot = wait_for_state(&store, |s| s.get("fresh").is_some()).await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(snapshot.get("stale"), None);
    assert_eq!(store.snapshot().get("stale"), None);
    assert_eq!(store.snapshot().get("kept"), Some(&entry(1)));
}
