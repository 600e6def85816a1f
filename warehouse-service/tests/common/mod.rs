#![allow(dead_code)]

use std::sync::Arc;

use shared::{OrderId, PieceType};
use warehouse_service::memory::MemoryStore;
use warehouse_service::models::{Piece, PieceStatus};
use warehouse_service::publisher::RecordingPublisher;
use warehouse_service::{Warehouse, WarehouseConfig};

pub const CAPACITY: i64 = 1000;

/// A warehouse wired to the in-memory store and a recording publisher.
#[derive(Clone)]
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub warehouse: Warehouse,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::with_capacity(CAPACITY))
    }

    pub fn with_ledger(reserved_units: i64) -> Self {
        Self::with_store(MemoryStore::with_ledger(reserved_units, CAPACITY))
    }

    pub fn with_store(store: MemoryStore) -> Self {
        let store = Arc::new(store);
        let publisher = Arc::new(RecordingPublisher::new());
        let warehouse = Warehouse::new(
            store.clone(),
            publisher.clone(),
            WarehouseConfig {
                max_capacity: CAPACITY,
                ..WarehouseConfig::default()
            },
        );
        Self {
            store,
            publisher,
            warehouse,
        }
    }

    pub async fn seed(&self, piece_type: PieceType, status: PieceStatus, order_id: Option<OrderId>) -> Piece {
        self.store.seed(piece_type, status, order_id).await
    }

    pub async fn seed_many(
        &self,
        count: usize,
        piece_type: PieceType,
        status: PieceStatus,
        order_id: Option<OrderId>,
    ) -> Vec<Piece> {
        let mut pieces = Vec::with_capacity(count);
        for _ in 0..count {
            pieces.push(self.seed(piece_type, status, order_id).await);
        }
        pieces
    }

    pub async fn piece(&self, piece_id: i64) -> Piece {
        use warehouse_service::store::PieceStore;
        self.store
            .get_piece(piece_id)
            .await
            .expect("store read failed")
            .expect("piece missing")
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warehouse_service=debug")
        .with_test_writer()
        .try_init();
}
