use std::sync::Arc;

use shared::PieceId;
use tracing::info;

use crate::completion::OrderCompletionWatcher;
use crate::error::{Entity, Result, WarehouseError};
use crate::models::{Piece, PieceStatus, PieceUpdate};
use crate::store::PieceStore;

/// Pieces that hold warehouse capacity for their order.
pub const HOLDING_CAPACITY: &[PieceStatus] = &[PieceStatus::Producing, PieceStatus::Produced];

/// States a piece may leave for `to`. Status only moves forward along
/// QUEUED, PRODUCING, PRODUCED, or sideways to CANCELLED before it is
/// finished.
fn allowed_sources(to: PieceStatus) -> &'static [PieceStatus] {
    match to {
        PieceStatus::Queued => &[],
        PieceStatus::Producing => &[PieceStatus::Queued],
        PieceStatus::Produced | PieceStatus::Cancelled => {
            &[PieceStatus::Queued, PieceStatus::Producing]
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The piece was not finished; it is now CANCELLED and detached.
    Cancelled(Piece),
    /// The piece was already PRODUCED; it went back to free stock.
    Released(Piece),
}

#[derive(Clone)]
pub struct PieceLifecycle {
    pieces: Arc<dyn PieceStore>,
    watcher: OrderCompletionWatcher,
}

impl PieceLifecycle {
    pub fn new(pieces: Arc<dyn PieceStore>, watcher: OrderCompletionWatcher) -> Self {
        Self { pieces, watcher }
    }

    pub async fn mark_producing(&self, piece_id: PieceId) -> Result<Piece> {
        match self
            .pieces
            .transition(
                piece_id,
                allowed_sources(PieceStatus::Producing),
                PieceUpdate::status(PieceStatus::Producing),
            )
            .await?
        {
            Some(piece) => {
                info!(piece_id, order_id = ?piece.order_id, "Piece producing");
                Ok(piece)
            }
            None => Err(self.rejection(piece_id, PieceStatus::Producing).await),
        }
    }

    /// Marks the piece produced and, when it belongs to an order, checks
    /// the order for completion against the same transaction's view.
    pub async fn mark_produced(&self, piece_id: PieceId) -> Result<Piece> {
        let Some(transition) = self
            .pieces
            .transition_in_order(
                piece_id,
                allowed_sources(PieceStatus::Produced),
                PieceUpdate::status(PieceStatus::Produced),
            )
            .await?
        else {
            return Err(self.rejection(piece_id, PieceStatus::Produced).await);
        };

        let piece = transition.piece;
        info!(piece_id, order_id = ?piece.order_id, "Piece produced");

        if let Some(order_id) = piece.order_id {
            self.watcher.check(order_id, &transition.order_pieces).await?;
        }
        Ok(piece)
    }

    pub async fn cancel(&self, piece_id: PieceId) -> Result<CancelOutcome> {
        if let Some(piece) = self
            .pieces
            .transition(piece_id, allowed_sources(PieceStatus::Cancelled), PieceUpdate::cancel())
            .await?
        {
            info!(piece_id, "Piece cancelled");
            return Ok(CancelOutcome::Cancelled(piece));
        }

        if let Some(piece) = self
            .pieces
            .transition(piece_id, &[PieceStatus::Produced], PieceUpdate::detach())
            .await?
        {
            info!(piece_id, "Produced piece returned to free stock");
            return Ok(CancelOutcome::Released(piece));
        }

        Err(self.rejection(piece_id, PieceStatus::Cancelled).await)
    }

    /// Explains why a compare-and-set matched no row.
    async fn rejection(&self, piece_id: PieceId, to: PieceStatus) -> WarehouseError {
        match self.pieces.get_piece(piece_id).await {
            Ok(Some(piece)) => WarehouseError::InvalidTransition {
                piece_id,
                from: piece.status,
                to,
            },
            Ok(None) => WarehouseError::MissingEntity(Entity::Piece(piece_id)),
            Err(e) => e,
        }
    }
}
