mod common;

use common::Harness;
use serde_json::json;
use shared::{
    CancelCommand, PieceType, ReleaseCommand, ReplyStatus, ReserveCommand, ResponseAddress,
};
use warehouse_service::models::{MovementKind, PieceStatus};
use warehouse_service::store::{CapacityLedger, PieceStore};
use warehouse_service::WarehouseError;

fn reserve(order_id: i64) -> ReserveCommand {
    ReserveCommand {
        order_id,
        response_address: ResponseAddress {
            topic: "saga.replies".to_string(),
            key: Some(format!("saga-{order_id}")),
        },
    }
}

#[tokio::test]
async fn reserve_beyond_capacity_is_rejected_and_ledger_unchanged() {
    let h = Harness::with_ledger(995);
    h.seed_many(10, PieceType::A, PieceStatus::Producing, Some(1)).await;

    let reply = h.warehouse.saga.reserve(&reserve(1)).await;

    assert_eq!(reply.status, ReplyStatus::Error);
    assert!(reply.detail.as_deref().unwrap_or_default().contains("capacity exceeded"));
    assert_eq!(h.store.snapshot().await.expect("ledger read").reserved_units, 995);
    assert!(h.store.movements().await.is_empty());

    let replies = h.publisher.on_topic("saga.replies");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].key.as_deref(), Some("saga-1"));
    assert_eq!(replies[0].payload["status"], json!("Error"));
}

#[tokio::test]
async fn reserve_counts_started_pieces_and_cancels_queued_ones() {
    let h = Harness::new();
    h.seed_many(3, PieceType::A, PieceStatus::Producing, Some(6)).await;
    h.seed_many(2, PieceType::B, PieceStatus::Produced, Some(6)).await;
    let queued = h.seed(PieceType::A, PieceStatus::Queued, Some(6)).await;

    let reply = h.warehouse.saga.reserve(&reserve(6)).await;

    assert!(reply.is_ok());
    let ledger = h.store.snapshot().await.expect("ledger read");
    assert_eq!(ledger.reserved_units, 5);

    let queued = h.piece(queued.id).await;
    assert_eq!(queued.status, PieceStatus::Cancelled);
    assert_eq!(queued.order_id, None);

    let cancels = h.publisher.on_topic("machine.piece.cancel");
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].payload, json!({"piece_id": queued.id}));

    let replies = h.publisher.on_topic("saga.replies");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].payload, json!({"status": "OK"}));

    let movements = h.store.movements().await;
    assert_eq!(movements.len(), 1);
    assert_eq!(movements[0].kind, MovementKind::Reserve);
    assert_eq!(movements[0].reserved_after, 5);
}

#[tokio::test]
async fn reserve_reply_without_key_is_still_sent() {
    let h = Harness::new();
    let command = ReserveCommand {
        order_id: 12,
        response_address: ResponseAddress {
            topic: "saga.replies".to_string(),
            key: None,
        },
    };

    let reply = h.warehouse.saga.reserve(&command).await;

    assert!(reply.is_ok());
    let replies = h.publisher.on_topic("saga.replies");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].key, None);
}

#[tokio::test]
async fn undeliverable_reply_does_not_undo_the_reservation() {
    common::init_tracing();
    let h = Harness::new();
    h.seed_many(4, PieceType::A, PieceStatus::Produced, Some(8)).await;
    h.publisher.fail_on("saga.replies");

    let reply = h.warehouse.saga.reserve(&reserve(8)).await;

    assert!(reply.is_ok());
    assert_eq!(h.store.snapshot().await.expect("ledger read").reserved_units, 4);
    assert!(h.publisher.on_topic("saga.replies").is_empty());
}

#[tokio::test]
async fn duplicate_reserve_is_counted_once() {
    let h = Harness::new();
    h.seed_many(3, PieceType::A, PieceStatus::Producing, Some(5)).await;

    assert!(h.warehouse.saga.reserve(&reserve(5)).await.is_ok());
    assert!(h.warehouse.saga.reserve(&reserve(5)).await.is_ok());

    assert_eq!(h.store.snapshot().await.expect("ledger read").reserved_units, 3);
    assert_eq!(h.store.movements().await.len(), 1);
    assert_eq!(h.publisher.on_topic("saga.replies").len(), 2);
}

#[tokio::test]
async fn release_returns_units_held_by_the_order() {
    let h = Harness::with_ledger(6);
    h.seed_many(4, PieceType::A, PieceStatus::Produced, Some(7)).await;
    h.seed(PieceType::A, PieceStatus::Queued, Some(7)).await;
    assert!(h.warehouse.saga.reserve(&reserve(7)).await.is_ok());

    let outcome = h
        .warehouse
        .saga
        .release(&ReleaseCommand { order_id: 7 })
        .await
        .expect("release failed");

    assert_eq!(outcome.released, 4);
    assert!(!outcome.clamped);
    assert_eq!(outcome.snapshot.reserved_units, 6);
}

#[tokio::test]
async fn release_is_bounded_by_what_the_order_holds() {
    let h = Harness::new();
    h.seed_many(4, PieceType::B, PieceStatus::Producing, Some(3)).await;
    assert!(h.warehouse.saga.reserve(&reserve(3)).await.is_ok());
    h.seed_many(2, PieceType::B, PieceStatus::Producing, Some(3)).await;

    let outcome = h
        .warehouse
        .saga
        .release(&ReleaseCommand { order_id: 3 })
        .await
        .expect("release failed");

    assert!(outcome.clamped);
    assert_eq!(outcome.released, 4);
    assert_eq!(outcome.snapshot.reserved_units, 0);

    let movements = h.store.movements().await;
    assert_eq!(movements.len(), 2);
    assert_eq!(movements[1].kind, MovementKind::Release);
    assert_eq!(movements[1].requested_units, 6);
    assert_eq!(movements[1].applied_units, 4);
}

#[tokio::test]
async fn duplicate_release_leaves_other_reservations_alone() {
    let h = Harness::with_ledger(5);
    h.seed_many(3, PieceType::A, PieceStatus::Produced, Some(4)).await;
    h.seed_many(2, PieceType::A, PieceStatus::Produced, Some(11)).await;
    assert!(h.warehouse.saga.reserve(&reserve(4)).await.is_ok());

    let first = h
        .warehouse
        .saga
        .release(&ReleaseCommand { order_id: 4 })
        .await
        .expect("release failed");
    assert_eq!(first.released, 3);
    assert_eq!(first.snapshot.reserved_units, 5);

    let again = h
        .warehouse
        .saga
        .release(&ReleaseCommand { order_id: 4 })
        .await
        .expect("release failed");
    assert_eq!(again.released, 0);
    assert!(again.clamped);
    assert_eq!(again.snapshot.reserved_units, 5);

    // Order 11 never reserved anything.
    let unreserved = h
        .warehouse
        .saga
        .release(&ReleaseCommand { order_id: 11 })
        .await
        .expect("release failed");
    assert_eq!(unreserved.released, 0);
    assert_eq!(h.store.snapshot().await.expect("ledger read").reserved_units, 5);
    assert_eq!(h.store.movements().await.len(), 2);
}

#[tokio::test]
async fn cancel_withdraws_unfinished_pieces_and_frees_finished_ones() {
    let h = Harness::new();
    let queued = h.seed(PieceType::A, PieceStatus::Queued, Some(9)).await;
    let producing = h.seed(PieceType::A, PieceStatus::Producing, Some(9)).await;
    let produced = h.seed(PieceType::B, PieceStatus::Produced, Some(9)).await;

    let event = h
        .warehouse
        .saga
        .cancel(&CancelCommand { order_id: 9 })
        .await
        .expect("cancel failed");

    assert_eq!(event.cancelled_piece_ids, vec![queued.id, producing.id]);

    let queued = h.piece(queued.id).await;
    assert_eq!(queued.status, PieceStatus::Cancelled);
    assert_eq!(queued.order_id, None);

    let producing = h.piece(producing.id).await;
    assert_eq!(producing.status, PieceStatus::Producing);
    assert_eq!(producing.order_id, None);

    let produced = h.piece(produced.id).await;
    assert_eq!(produced.status, PieceStatus::Produced);
    assert!(produced.is_free());

    let events = h.publisher.on_topic("warehouse.cancelled");
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].payload,
        json!({"order_id": 9, "cancelled_piece_ids": [queued.id, producing.id]})
    );
    assert_eq!(h.publisher.on_topic("machine.piece.cancel").len(), 2);
    assert!(h.store.pieces_by_order(9).await.expect("read failed").is_empty());
}

#[tokio::test]
async fn cancel_event_failure_is_left_for_redelivery() {
    let h = Harness::new();
    h.seed(PieceType::A, PieceStatus::Queued, Some(21)).await;
    h.publisher.fail_on("warehouse.cancelled");

    let err = h
        .warehouse
        .saga
        .cancel(&CancelCommand { order_id: 21 })
        .await
        .expect_err("publish failure swallowed");

    assert!(matches!(err, WarehouseError::Publish { .. }));
    assert_eq!(err.disposition(), warehouse_service::Disposition::Redeliver);
}

#[tokio::test]
async fn cancel_retry_reports_the_same_pieces() {
    let h = Harness::new();
    let queued = h.seed(PieceType::A, PieceStatus::Queued, Some(22)).await;
    let producing = h.seed(PieceType::B, PieceStatus::Producing, Some(22)).await;
    h.publisher.fail_on("warehouse.cancelled");

    h.warehouse
        .saga
        .cancel(&CancelCommand { order_id: 22 })
        .await
        .expect_err("publish failure swallowed");
    assert_eq!(h.publisher.on_topic("machine.piece.cancel").len(), 2);

    h.publisher.recover("warehouse.cancelled");
    let event = h
        .warehouse
        .saga
        .cancel(&CancelCommand { order_id: 22 })
        .await
        .expect("retry failed");

    assert_eq!(event.cancelled_piece_ids, vec![queued.id, producing.id]);
    let events = h.publisher.on_topic("warehouse.cancelled");
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].payload,
        json!({"order_id": 22, "cancelled_piece_ids": [queued.id, producing.id]})
    );
    assert_eq!(h.publisher.on_topic("machine.piece.cancel").len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reservations_never_exceed_capacity() {
    let h = Harness::with_ledger(900);
    for order_id in 0..20 {
        h.seed_many(10, PieceType::A, PieceStatus::Producing, Some(order_id)).await;
    }

    let mut tasks = Vec::new();
    for order_id in 0..20 {
        let saga = h.warehouse.saga.clone();
        tasks.push(tokio::spawn(async move { saga.reserve(&reserve(order_id)).await }));
    }

    let mut accepted = 0;
    for task in tasks {
        if task.await.expect("task panicked").is_ok() {
            accepted += 1;
        }
    }

    let ledger = h.store.snapshot().await.expect("ledger read");
    assert_eq!(accepted, 10);
    assert_eq!(ledger.reserved_units, 1000);
    assert!(ledger.reserved_units <= ledger.max_capacity);
}
