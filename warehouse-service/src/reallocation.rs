use std::sync::Arc;

use shared::{OrderId, PieceDemand, PieceId, PieceType, ProduceRequest};
use tracing::info;

use crate::completion::OrderCompletionWatcher;
use crate::error::Result;
use crate::models::{NewPiece, Piece, PieceStatus};
use crate::publisher::{EventPublisher, OutboundMessage, Topics};
use crate::store::PieceStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reallocation {
    /// Free pieces attached to the order by this call.
    pub reused: Vec<PieceId>,
    /// QUEUED pieces of the order sent to production by this call.
    pub requested: Vec<PieceId>,
}

impl Reallocation {
    pub fn shortfall(&self) -> usize {
        self.requested.len()
    }
}

/// Satisfies demand from free stock first and orders production for the rest.
#[derive(Clone)]
pub struct ReallocationEngine {
    pieces: Arc<dyn PieceStore>,
    publisher: Arc<dyn EventPublisher>,
    topics: Topics,
    watcher: OrderCompletionWatcher,
}

impl ReallocationEngine {
    pub fn new(
        pieces: Arc<dyn PieceStore>,
        publisher: Arc<dyn EventPublisher>,
        topics: Topics,
        watcher: OrderCompletionWatcher,
    ) -> Self {
        Self {
            pieces,
            publisher,
            topics,
            watcher,
        }
    }

    /// Safe to repeat for the same order: pieces already attached count
    /// against the demand, and every QUEUED piece is sent to production again
    /// in case an earlier attempt failed before its request went out.
    pub async fn reallocate(&self, order_id: OrderId, demand: &[PieceDemand]) -> Result<Reallocation> {
        let mut outcome = Reallocation::default();
        let attached = self.pieces.pieces_by_order(order_id).await?;

        for (piece_type, quantity) in merge_demand(demand) {
            let mut queued: Vec<Piece> = Vec::new();
            let mut held = 0;
            for piece in attached.iter().filter(|piece| piece.piece_type == piece_type) {
                match piece.status {
                    PieceStatus::Queued => queued.push(piece.clone()),
                    PieceStatus::Producing | PieceStatus::Produced => {}
                    PieceStatus::Cancelled => continue,
                }
                held += 1;
            }

            let needed = (quantity as usize).saturating_sub(held);
            let claimed = self
                .pieces
                .claim_free(order_id, piece_type, needed as i64)
                .await?;
            let missing = needed.saturating_sub(claimed.len());

            info!(
                order_id,
                %piece_type,
                quantity,
                attached = held,
                reused = claimed.len(),
                missing,
                "Reallocated pieces"
            );
            outcome.reused.extend(claimed.iter().map(|piece| piece.id));

            for _ in 0..missing {
                let piece = self
                    .pieces
                    .create_piece(NewPiece::queued(order_id, piece_type))
                    .await?;
                queued.push(piece);
            }

            for piece in &queued {
                self.request_production(&ProduceRequest {
                    piece_id: piece.id,
                    piece_type: piece.piece_type,
                })
                .await?;
                outcome.requested.push(piece.id);
            }
        }

        let order_pieces = self.pieces.pieces_by_order(order_id).await?;
        self.watcher.check(order_id, &order_pieces).await?;
        Ok(outcome)
    }

    async fn request_production(&self, request: &ProduceRequest) -> Result<()> {
        let message = OutboundMessage::json(
            self.topics.produce(request.piece_type),
            Some(request.piece_id.to_string()),
            request,
        )?;
        self.publisher.publish(message).await
    }
}

/// Sums quantities of repeated piece types, keeping first-seen order.
fn merge_demand(demand: &[PieceDemand]) -> Vec<(PieceType, u32)> {
    let mut merged: Vec<(PieceType, u32)> = Vec::new();
    for item in demand {
        match merged.iter_mut().find(|(piece_type, _)| *piece_type == item.piece_type) {
            Some((_, quantity)) => *quantity = quantity.saturating_add(item.quantity),
            None => merged.push((item.piece_type, item.quantity)),
        }
    }
    merged
}
