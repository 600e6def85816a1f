use async_trait::async_trait;
use shared::{OrderId, PieceId, PieceType};

use crate::error::Result;
use crate::models::{LedgerSnapshot, NewPiece, Piece, PieceStatus, PieceUpdate};

/// A piece transition together with every piece of its order as seen by the
/// same transaction, after the change.
#[derive(Debug, Clone)]
pub struct OrderTransition {
    pub piece: Piece,
    pub order_pieces: Vec<Piece>,
}

/// What one order cancellation changed, plus every piece id ever withdrawn
/// from production for the order, so a repeated cancel reports the same ids.
#[derive(Debug, Clone, Default)]
pub struct OrderCancellation {
    /// QUEUED pieces now CANCELLED and detached.
    pub cancelled: Vec<Piece>,
    /// PRODUCING pieces detached with their status kept.
    pub withdrawn: Vec<Piece>,
    /// PRODUCED pieces returned to free stock.
    pub returned: Vec<Piece>,
    /// Sorted ascending.
    pub cancelled_piece_ids: Vec<PieceId>,
}

/// Durable piece table. Every mutating method is one compare-and-set against
/// the current row state; none of them read, decide, then write.
#[async_trait]
pub trait PieceStore: Send + Sync {
    async fn create_piece(&self, piece: NewPiece) -> Result<Piece>;

    async fn get_piece(&self, piece_id: PieceId) -> Result<Option<Piece>>;

    async fn list_pieces(&self) -> Result<Vec<Piece>>;

    async fn pieces_by_order(&self, order_id: OrderId) -> Result<Vec<Piece>>;

    async fn pieces_by_status(&self, status: PieceStatus) -> Result<Vec<Piece>>;

    async fn count_by_order(&self, order_id: OrderId, statuses: &[PieceStatus]) -> Result<i64>;

    /// Applies `update` if the piece is currently in one of `from`.
    /// Returns `None` when the piece is missing or in another state.
    async fn transition(
        &self,
        piece_id: PieceId,
        from: &[PieceStatus],
        update: PieceUpdate,
    ) -> Result<Option<Piece>>;

    /// Like [`PieceStore::transition`], but serialized against other
    /// transitions of the same order and returning the order's pieces as
    /// committed by this change.
    async fn transition_in_order(
        &self,
        piece_id: PieceId,
        from: &[PieceStatus],
        update: PieceUpdate,
    ) -> Result<Option<OrderTransition>>;

    /// Applies `update` to every piece of the order currently in one of `from`.
    /// The order's rows are locked in id order first.
    async fn transition_order(
        &self,
        order_id: OrderId,
        from: &[PieceStatus],
        update: PieceUpdate,
    ) -> Result<Vec<Piece>>;

    /// Withdraws the order's unfinished pieces and frees its finished ones in
    /// one transaction, recording the withdrawn ids against the order.
    async fn cancel_order(&self, order_id: OrderId) -> Result<OrderCancellation>;

    /// Attaches up to `limit` free pieces of `piece_type` to the order,
    /// skipping rows another claimer holds instead of waiting for them.
    async fn claim_free(
        &self,
        order_id: OrderId,
        piece_type: PieceType,
        limit: i64,
    ) -> Result<Vec<Piece>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseOutcome {
    pub snapshot: LedgerSnapshot,
    pub released: i64,
    /// Less than requested was released.
    pub clamped: bool,
}

/// Single counter row bounding the units held by outstanding orders.
#[async_trait]
pub trait CapacityLedger: Send + Sync {
    async fn snapshot(&self) -> Result<LedgerSnapshot>;

    /// Adds `amount` iff `reserved_units + amount <= max_capacity`, otherwise
    /// fails with `CapacityExceeded` and changes nothing. An order that
    /// already holds units is left as it is.
    async fn try_reserve(
        &self,
        order_id: OrderId,
        amount: i64,
        max_capacity: i64,
    ) -> Result<LedgerSnapshot>;

    /// Subtracts up to `amount`, bounded by what the order still holds and
    /// never going below zero.
    async fn release(&self, order_id: OrderId, amount: i64) -> Result<ReleaseOutcome>;
}
