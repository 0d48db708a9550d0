use std::sync::Arc;

use prediction_state::{
    predictions::{PredictionUpdate, PredictionUpdateKind, RequestStatus},
    service::ServiceError,
    testing::ScriptedPredictionService,
};

use crate::{entry, eventually, map, store_for, wait_for_state};

#[tokio::test]
async fn given_populated_map_when_push_arrives_then_only_that_key_changes() {
    let service = ScriptedPredictionService::new();
    service.push_batch(Ok(map(&[("x", 1), ("y", 2), ("z", 3)])));
    let store = store_for(&service, "v1").await;
    store.fetch_batch(["x", "y", "z"]).await.expect("batch should run");

    store.on_push_update("y", entry(20)).expect("push should merge");

    assert_eq!(
        *store.snapshot().predictions,
        map(&[("x", 1), ("y", 20), ("z", 3)])
    );
    assert_eq!(store.snapshot().status, RequestStatus::Ready);
}

#[tokio::test]
async fn given_same_push_twice_when_merged_then_second_push_is_a_no_op() {
    let service = ScriptedPredictionService::new();
    let store = store_for(&service, "v1").await;

    store.on_push_update("x", entry(9)).expect("push should merge");
    let first = store.snapshot().predictions;
    store.on_push_update("x", entry(9)).expect("push should merge");

    assert!(Arc::ptr_eq(&first, &store.snapshot().predictions));
    assert_eq!(*first, map(&[("x", 9)]));
}

#[tokio::test]
async fn given_new_key_when_pushed_then_it_is_inserted_and_previous_map_is_untouched() {
    let service = ScriptedPredictionService::new();
    let store = store_for(&service, "v1").await;
    let before = store.snapshot().predictions;

    store.on_push_update("fresh", entry(3)).expect("push should merge");

    assert!(before.is_empty());
    assert_eq!(store.snapshot().get("fresh"), Some(&entry(3)));
}

#[tokio::test]
async fn given_live_feed_when_service_pushes_then_store_merges_update() {
    let service = ScriptedPredictionService::new();
    service.push_batch(Ok(map(&[("x", 5), ("y", 7)])));
    let store = store_for(&service, "v1").await;
    store.fetch_batch(["x", "y"]).await.expect("batch should run");

    let delivered = service.push_update("v1", PredictionUpdate::new("x", entry(9)));
    assert_eq!(delivered, 1);

    let snapshot = wait_for_state(&store, |s| s.get("x") == Some(&entry(9))).await;
    assert_eq!(*snapshot.predictions, map(&[("x", 9), ("y", 7)]));
}

#[tokio::test]
async fn given_feed_message_of_other_kind_when_delivered_then_it_is_ignored() {
    let service = ScriptedPredictionService::new();
    let store = store_for(&service, "v1").await;

    service.push_update(
        "v1",
        PredictionUpdate {
            kind: PredictionUpdateKind::Other,
            item_id: "x".to_string(),
            prediction: entry(1),
        },
    );
    service.push_update("v1", PredictionUpdate::new("y", entry(2)));

    let snapshot = wait_for_state(&store, |s| s.get("y").is_some()).await;
    assert_eq!(snapshot.get("x"), None);
}

#[tokio::test]
async fn given_batch_in_flight_when_push_arrives_then_status_stays_loading() {
    let service = ScriptedPredictionService::new();
    let store = store_for(&service, "v1").await;
    let gate = service.push_gated_batch();
    let task = tokio::spawn({
        let store = store.clone();
        async move { store.fetch_batch(["x"]).await }
    });
    service.wait_for_calls(|calls| calls.batches.len() == 1).await;

    store.on_push_update("x", entry(9)).expect("push should merge");

    let snapshot = store.snapshot();
    assert!(snapshot.is_loading());
    assert_eq!(snapshot.get("x"), Some(&entry(9)));

    // Full replace: the batch snapshot overwrites the pushed value.
    gate.send(Ok(map(&[("x", 4)]))).expect("batch should be waiting");
    task.await.expect("task should join").expect("batch should run");
    assert_eq!(store.snapshot().get("x"), Some(&entry(4)));
}

#[tokio::test]
async fn given_feed_error_when_delivered_then_feed_is_closed_and_state_kept() {
    let service = ScriptedPredictionService::new();
    let store = store_for(&service, "v1").await;
    store.on_push_update("x", entry(1)).expect("push should merge");
    assert_eq!(service.live_feeds("v1"), 1);

    service.fail_feeds("v1", ServiceError::Protocol("bad frame".to_string()));

    eventually(|| service.live_feeds("v1") == 0).await;
    assert!(!store.has_live_subscription());
    assert_eq!(store.snapshot().get("x"), Some(&entry(1)));
}

#[tokio::test]
async fn given_service_closes_feed_when_pump_exits_then_subscription_is_not_live() {
    let service = ScriptedPredictionService::new();
    let store = store_for(&service, "v1").await;
    assert!(store.has_live_subscription());

    service.close_feeds("v1");

    eventually(|| !store.has_live_subscription()).await;
    assert_eq!(store.vendor_id().as_deref(), Some("v1"));
}
