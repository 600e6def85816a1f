use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use shared::{OrderId, PieceId, PieceType};
use tokio::sync::Mutex;

use crate::error::{Entity, Result, WarehouseError};
use crate::models::{
    held_units, CapacityMovement, LedgerSnapshot, MovementKind, NewPiece, Piece, PieceStatus,
    PieceUpdate,
};
use crate::store::{CapacityLedger, OrderCancellation, OrderTransition, PieceStore, ReleaseOutcome};

#[derive(Debug, Default)]
struct MemoryState {
    pieces: BTreeMap<PieceId, Piece>,
    next_id: PieceId,
    ledger: Option<LedgerSnapshot>,
    movements: Vec<CapacityMovement>,
    cancellations: BTreeMap<OrderId, BTreeSet<PieceId>>,
}

impl MemoryState {
    fn order_pieces(&self, order_id: OrderId) -> Vec<Piece> {
        self.pieces
            .values()
            .filter(|piece| piece.order_id == Some(order_id))
            .cloned()
            .collect()
    }

    fn held_by(&self, order_id: OrderId) -> i64 {
        held_units(
            self.movements
                .iter()
                .filter(|movement| movement.order_id == order_id)
                .map(|movement| (movement.kind, movement.applied_units)),
        )
    }

    fn ledger(&self) -> Result<LedgerSnapshot> {
        self.ledger.ok_or(WarehouseError::MissingEntity(Entity::Ledger(0)))
    }

    fn insert(&mut self, piece: NewPiece) -> Piece {
        self.next_id += 1;
        let now = Utc::now();
        let piece = Piece {
            id: self.next_id,
            order_id: piece.order_id,
            piece_type: piece.piece_type,
            status: piece.status,
            created_at: now,
            producing_started_at: None,
            produced_at: None,
            updated_at: now,
        };
        self.pieces.insert(piece.id, piece.clone());
        piece
    }
}

/// In-memory piece table and ledger with the same contract as the
/// PostgreSQL store. One lock around the whole state makes every call as
/// atomic as a single SQL statement.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_capacity: i64) -> Self {
        Self::with_ledger(0, max_capacity)
    }

    pub fn with_ledger(reserved_units: i64, max_capacity: i64) -> Self {
        let state = MemoryState {
            ledger: Some(LedgerSnapshot {
                reserved_units,
                max_capacity,
            }),
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Inserts a piece in any state, bypassing the lifecycle rules.
    pub async fn seed(
        &self,
        piece_type: PieceType,
        status: PieceStatus,
        order_id: Option<OrderId>,
    ) -> Piece {
        self.state.lock().await.insert(NewPiece {
            order_id,
            piece_type,
            status,
        })
    }

    pub async fn movements(&self) -> Vec<CapacityMovement> {
        self.state.lock().await.movements.clone()
    }
}

#[async_trait]
impl PieceStore for MemoryStore {
    async fn create_piece(&self, piece: NewPiece) -> Result<Piece> {
        Ok(self.state.lock().await.insert(piece))
    }

    async fn get_piece(&self, piece_id: PieceId) -> Result<Option<Piece>> {
        Ok(self.state.lock().await.pieces.get(&piece_id).cloned())
    }

    async fn list_pieces(&self) -> Result<Vec<Piece>> {
        Ok(self.state.lock().await.pieces.values().cloned().collect())
    }

    async fn pieces_by_order(&self, order_id: OrderId) -> Result<Vec<Piece>> {
        Ok(self.state.lock().await.order_pieces(order_id))
    }

    async fn pieces_by_status(&self, status: PieceStatus) -> Result<Vec<Piece>> {
        let state = self.state.lock().await;
        Ok(state
            .pieces
            .values()
            .filter(|piece| piece.status == status)
            .cloned()
            .collect())
    }

    async fn count_by_order(&self, order_id: OrderId, statuses: &[PieceStatus]) -> Result<i64> {
        let state = self.state.lock().await;
        let count = state
            .pieces
            .values()
            .filter(|piece| piece.order_id == Some(order_id) && statuses.contains(&piece.status))
            .count();
        Ok(count as i64)
    }

    async fn transition(
        &self,
        piece_id: PieceId,
        from: &[PieceStatus],
        update: PieceUpdate,
    ) -> Result<Option<Piece>> {
        let mut state = self.state.lock().await;
        let Some(piece) = state.pieces.get_mut(&piece_id) else {
            return Ok(None);
        };
        if !from.contains(&piece.status) {
            return Ok(None);
        }
        update.apply(piece, Utc::now());
        Ok(Some(piece.clone()))
    }

    async fn transition_in_order(
        &self,
        piece_id: PieceId,
        from: &[PieceStatus],
        update: PieceUpdate,
    ) -> Result<Option<OrderTransition>> {
        let mut state = self.state.lock().await;
        let Some(piece) = state.pieces.get_mut(&piece_id) else {
            return Ok(None);
        };
        if !from.contains(&piece.status) {
            return Ok(None);
        }
        update.apply(piece, Utc::now());
        let piece = piece.clone();
        let order_pieces = match piece.order_id {
            Some(order_id) => state.order_pieces(order_id),
            None => Vec::new(),
        };
        Ok(Some(OrderTransition { piece, order_pieces }))
    }

    async fn transition_order(
        &self,
        order_id: OrderId,
        from: &[PieceStatus],
        update: PieceUpdate,
    ) -> Result<Vec<Piece>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut changed = Vec::new();
        for piece in state.pieces.values_mut() {
            if piece.order_id == Some(order_id) && from.contains(&piece.status) {
                update.apply(piece, now);
                changed.push(piece.clone());
            }
        }
        Ok(changed)
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<OrderCancellation> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut outcome = OrderCancellation::default();

        for piece in state.pieces.values_mut() {
            if piece.order_id != Some(order_id) {
                continue;
            }
            match piece.status {
                PieceStatus::Queued => {
                    PieceUpdate::cancel().apply(piece, now);
                    outcome.cancelled.push(piece.clone());
                }
                PieceStatus::Producing => {
                    PieceUpdate::detach().apply(piece, now);
                    outcome.withdrawn.push(piece.clone());
                }
                PieceStatus::Produced => {
                    PieceUpdate::detach().apply(piece, now);
                    outcome.returned.push(piece.clone());
                }
                PieceStatus::Cancelled => {}
            }
        }

        let recorded = state.cancellations.entry(order_id).or_default();
        recorded.extend(outcome.cancelled.iter().chain(&outcome.withdrawn).map(|piece| piece.id));
        outcome.cancelled_piece_ids = recorded.iter().copied().collect();
        Ok(outcome)
    }

    async fn claim_free(
        &self,
        order_id: OrderId,
        piece_type: PieceType,
        limit: i64,
    ) -> Result<Vec<Piece>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let limit = usize::try_from(limit).unwrap_or(0);
        let mut claimed = Vec::new();
        for piece in state.pieces.values_mut() {
            if claimed.len() == limit {
                break;
            }
            if piece.is_free() && piece.piece_type == piece_type {
                PieceUpdate::assign(order_id).apply(piece, now);
                claimed.push(piece.clone());
            }
        }
        Ok(claimed)
    }
}

#[async_trait]
impl CapacityLedger for MemoryStore {
    async fn snapshot(&self) -> Result<LedgerSnapshot> {
        self.state.lock().await.ledger()
    }

    async fn try_reserve(
        &self,
        order_id: OrderId,
        amount: i64,
        max_capacity: i64,
    ) -> Result<LedgerSnapshot> {
        let mut state = self.state.lock().await;
        let current = state.ledger()?;
        if amount <= 0 || state.held_by(order_id) > 0 {
            return Ok(current);
        }
        if current.reserved_units + amount > max_capacity {
            return Err(WarehouseError::CapacityExceeded {
                requested: amount,
                reserved: current.reserved_units,
                max_capacity,
            });
        }

        let next = LedgerSnapshot {
            reserved_units: current.reserved_units + amount,
            ..current
        };
        state.ledger = Some(next);
        state.movements.push(CapacityMovement {
            order_id,
            kind: MovementKind::Reserve,
            requested_units: amount,
            applied_units: amount,
            reserved_after: next.reserved_units,
        });
        Ok(next)
    }

    async fn release(&self, order_id: OrderId, amount: i64) -> Result<ReleaseOutcome> {
        let mut state = self.state.lock().await;
        let current = state.ledger()?;
        if amount <= 0 {
            return Ok(ReleaseOutcome {
                snapshot: current,
                released: 0,
                clamped: false,
            });
        }

        let released = amount.min(state.held_by(order_id)).min(current.reserved_units);
        if released == 0 {
            return Ok(ReleaseOutcome {
                snapshot: current,
                released: 0,
                clamped: true,
            });
        }

        let next = LedgerSnapshot {
            reserved_units: current.reserved_units - released,
            ..current
        };
        state.ledger = Some(next);
        state.movements.push(CapacityMovement {
            order_id,
            kind: MovementKind::Release,
            requested_units: amount,
            applied_units: released,
            reserved_after: next.reserved_units,
        });
        Ok(ReleaseOutcome {
            snapshot: next,
            released,
            clamped: released < amount,
        })
    }
}
