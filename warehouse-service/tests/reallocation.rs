mod common;

use std::collections::HashSet;

use common::Harness;
use serde_json::json;
use shared::{PieceDemand, PieceType};
use warehouse_service::models::PieceStatus;
use warehouse_service::store::PieceStore;

fn demand(piece_type: PieceType, quantity: u32) -> Vec<PieceDemand> {
    vec![PieceDemand {
        piece_type,
        quantity,
    }]
}

#[tokio::test]
async fn free_stock_is_reused_before_production_is_requested() {
    let h = Harness::new();
    let free = h.seed_many(3, PieceType::A, PieceStatus::Produced, None).await;

    let outcome = h
        .warehouse
        .reallocation
        .reallocate(7, &demand(PieceType::A, 5))
        .await
        .expect("reallocation failed");

    assert_eq!(outcome.shortfall(), 2);
    let free_ids: Vec<_> = free.iter().map(|p| p.id).collect();
    assert_eq!(outcome.reused, free_ids);

    for id in &outcome.reused {
        let piece = h.piece(*id).await;
        assert_eq!(piece.order_id, Some(7));
        assert_eq!(piece.status, PieceStatus::Produced);
    }
    for id in &outcome.requested {
        let piece = h.piece(*id).await;
        assert_eq!(piece.order_id, Some(7));
        assert_eq!(piece.status, PieceStatus::Queued);
    }

    let requests = h.publisher.on_topic("machine.piece.produce.A");
    assert_eq!(requests.len(), 2);
    for (message, id) in requests.iter().zip(&outcome.requested) {
        assert_eq!(message.key.as_deref(), Some(id.to_string().as_str()));
        assert_eq!(message.payload, json!({"piece_id": id, "piece_type": "A"}));
    }
    assert!(h.publisher.on_topic("order.status.update").is_empty());
}

#[tokio::test]
async fn demand_met_from_stock_completes_the_order() {
    let h = Harness::new();
    h.seed_many(2, PieceType::B, PieceStatus::Produced, None).await;

    let outcome = h
        .warehouse
        .reallocation
        .reallocate(2, &demand(PieceType::B, 2))
        .await
        .expect("reallocation failed");

    assert_eq!(outcome.shortfall(), 0);
    let completed = h.publisher.on_topic("order.status.update");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].payload, json!({"order_id": 2, "status": "Processed"}));
}

#[tokio::test]
async fn only_free_pieces_of_the_requested_type_are_claimed() {
    let h = Harness::new();
    let other_type = h.seed(PieceType::B, PieceStatus::Produced, None).await;
    let attached = h.seed(PieceType::A, PieceStatus::Produced, Some(99)).await;
    let unfinished = h.seed(PieceType::A, PieceStatus::Producing, None).await;
    let cancelled = h.seed(PieceType::A, PieceStatus::Cancelled, None).await;

    let outcome = h
        .warehouse
        .reallocation
        .reallocate(3, &demand(PieceType::A, 1))
        .await
        .expect("reallocation failed");

    assert!(outcome.reused.is_empty());
    assert_eq!(outcome.shortfall(), 1);
    assert_eq!(h.piece(other_type.id).await.order_id, None);
    assert_eq!(h.piece(attached.id).await.order_id, Some(99));
    assert_eq!(h.piece(unfinished.id).await.order_id, None);
    assert_eq!(h.piece(cancelled.id).await.order_id, None);
}

#[tokio::test]
async fn mixed_demand_routes_production_per_type() {
    let h = Harness::new();
    h.seed(PieceType::A, PieceStatus::Produced, None).await;

    let request = vec![
        PieceDemand {
            piece_type: PieceType::A,
            quantity: 2,
        },
        PieceDemand {
            piece_type: PieceType::B,
            quantity: 3,
        },
    ];
    let outcome = h
        .warehouse
        .reallocation
        .reallocate(11, &request)
        .await
        .expect("reallocation failed");

    assert_eq!(outcome.reused.len(), 1);
    assert_eq!(outcome.shortfall(), 4);
    assert_eq!(h.publisher.on_topic("machine.piece.produce.A").len(), 1);
    assert_eq!(h.publisher.on_topic("machine.piece.produce.B").len(), 3);
    assert_eq!(h.store.pieces_by_order(11).await.expect("read failed").len(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_reallocations_never_claim_a_piece_twice() {
    let h = Harness::new();
    h.seed_many(5, PieceType::A, PieceStatus::Produced, None).await;

    let mut tasks = Vec::new();
    for order_id in 100..108 {
        let engine = h.warehouse.reallocation.clone();
        tasks.push(tokio::spawn(async move {
            engine.reallocate(order_id, &demand(PieceType::A, 1)).await
        }));
    }

    let mut reused = Vec::new();
    let mut requested = 0;
    for task in tasks {
        let outcome = task.await.expect("task panicked").expect("reallocation failed");
        reused.extend(outcome.reused.iter().copied());
        requested += outcome.shortfall();
    }

    let distinct: HashSet<_> = reused.iter().collect();
    assert_eq!(reused.len(), 5);
    assert_eq!(distinct.len(), 5);
    assert_eq!(requested, 3);

    for order_id in 100..108 {
        let pieces = h.store.pieces_by_order(order_id).await.expect("read failed");
        assert_eq!(pieces.len(), 1, "order {order_id}");
    }
}

#[tokio::test]
async fn redelivered_request_resends_queued_pieces_instead_of_creating_more() {
    let h = Harness::new();
    h.publisher.fail_on("machine.piece.produce.A");

    h.warehouse
        .reallocation
        .reallocate(14, &demand(PieceType::A, 1))
        .await
        .expect_err("publish failure swallowed");
    let pieces = h.store.pieces_by_order(14).await.expect("read failed");
    assert_eq!(pieces.len(), 1);
    assert_eq!(pieces[0].status, PieceStatus::Queued);

    h.publisher.recover("machine.piece.produce.A");
    let outcome = h
        .warehouse
        .reallocation
        .reallocate(14, &demand(PieceType::A, 1))
        .await
        .expect("redelivery failed");

    assert!(outcome.reused.is_empty());
    assert_eq!(outcome.requested, vec![pieces[0].id]);
    assert_eq!(h.store.pieces_by_order(14).await.expect("read failed").len(), 1);

    let requests = h.publisher.on_topic("machine.piece.produce.A");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].payload, json!({"piece_id": pieces[0].id, "piece_type": "A"}));
}

#[tokio::test]
async fn repeated_request_keeps_pieces_already_attached() {
    let h = Harness::new();
    h.seed(PieceType::B, PieceStatus::Producing, Some(15)).await;
    h.seed(PieceType::B, PieceStatus::Produced, None).await;

    let outcome = h
        .warehouse
        .reallocation
        .reallocate(15, &demand(PieceType::B, 2))
        .await
        .expect("reallocation failed");

    assert_eq!(outcome.reused.len(), 1);
    assert_eq!(outcome.shortfall(), 0);
    assert_eq!(h.store.pieces_by_order(15).await.expect("read failed").len(), 2);
    assert!(h.publisher.on_topic("machine.piece.produce.B").is_empty());
    // One piece is still in production.
    assert!(h.publisher.on_topic("order.status.update").is_empty());
}

#[tokio::test]
async fn empty_demand_completes_nothing() {
    let h = Harness::new();

    let outcome = h
        .warehouse
        .reallocation
        .reallocate(16, &[])
        .await
        .expect("reallocation failed");

    assert_eq!(outcome, Default::default());
    assert!(h.publisher.messages().is_empty());

    let zero = h
        .warehouse
        .reallocation
        .reallocate(16, &demand(PieceType::A, 0))
        .await
        .expect("reallocation failed");
    assert_eq!(zero.shortfall(), 0);
    assert!(h.publisher.messages().is_empty());
}
