use std::sync::Arc;

use shared::{
    CancelCommand, OrderCancelled, OrderId, PieceCancelRequest, PieceId, ReleaseCommand,
    ReserveCommand, ReserveReply,
};
use tracing::{error, info, warn};

use crate::error::{Result, WarehouseError};
use crate::lifecycle::HOLDING_CAPACITY;
use crate::models::{LedgerSnapshot, PieceStatus, PieceUpdate};
use crate::publisher::{EventPublisher, OutboundMessage, Topics};
use crate::store::{CapacityLedger, PieceStore, ReleaseOutcome};

/// Answers the coordinator's reserve, release and cancel commands.
#[derive(Clone)]
pub struct SagaCommandHandler {
    pieces: Arc<dyn PieceStore>,
    ledger: Arc<dyn CapacityLedger>,
    publisher: Arc<dyn EventPublisher>,
    topics: Topics,
    max_capacity: i64,
}

impl SagaCommandHandler {
    pub fn new(
        pieces: Arc<dyn PieceStore>,
        ledger: Arc<dyn CapacityLedger>,
        publisher: Arc<dyn EventPublisher>,
        topics: Topics,
        max_capacity: i64,
    ) -> Self {
        Self {
            pieces,
            ledger,
            publisher,
            topics,
            max_capacity,
        }
    }

    /// Always produces a reply and sends it to the caller's address; every
    /// failure is folded into an `Error` reply.
    pub async fn reserve(&self, command: &ReserveCommand) -> ReserveReply {
        let order_id = command.order_id;
        let reply = match self.try_reserve(order_id).await {
            Ok(snapshot) => {
                info!(
                    order_id,
                    reserved_units = snapshot.reserved_units,
                    available = snapshot.available(),
                    "Warehouse space reserved"
                );
                ReserveReply::ok()
            }
            Err(e @ WarehouseError::CapacityExceeded { .. }) => {
                info!(order_id, "Warehouse reserve rejected: {}", e);
                ReserveReply::error(e.to_string())
            }
            Err(e) => {
                error!(order_id, "Warehouse reserve failed: {}", e);
                ReserveReply::error(e.to_string())
            }
        };

        let address = &command.response_address;
        let sent = match OutboundMessage::json(address.topic.clone(), address.key.clone(), &reply) {
            Ok(message) => self.publisher.publish(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            error!(
                order_id,
                topic = %address.topic,
                key = ?address.key,
                status = ?reply.status,
                "Reserve reply could not be delivered, saga needs manual intervention: {}",
                e
            );
        }

        reply
    }

    async fn try_reserve(&self, order_id: OrderId) -> Result<LedgerSnapshot> {
        let cancelled = self
            .pieces
            .transition_order(order_id, &[PieceStatus::Queued], PieceUpdate::cancel())
            .await?;
        if !cancelled.is_empty() {
            info!(order_id, cancelled = cancelled.len(), "Cancelled queued pieces before reserving");
        }
        for piece in &cancelled {
            self.request_cancellation(piece.id).await;
        }

        let holding = self.pieces.count_by_order(order_id, HOLDING_CAPACITY).await?;
        self.ledger.try_reserve(order_id, holding, self.max_capacity).await
    }

    pub async fn release(&self, command: &ReleaseCommand) -> Result<ReleaseOutcome> {
        let order_id = command.order_id;
        let holding = self.pieces.count_by_order(order_id, HOLDING_CAPACITY).await?;
        let outcome = self.ledger.release(order_id, holding).await?;

        if outcome.clamped {
            warn!(
                order_id,
                requested = holding,
                released = outcome.released,
                "Release exceeded what the order holds, ledger clamped"
            );
        } else {
            info!(
                order_id,
                released = outcome.released,
                reserved_units = outcome.snapshot.reserved_units,
                "Warehouse space released"
            );
        }
        Ok(outcome)
    }

    /// Compensates an order: unfinished pieces are withdrawn from production,
    /// finished ones go back to free stock.
    pub async fn cancel(&self, command: &CancelCommand) -> Result<OrderCancelled> {
        let order_id = command.order_id;

        // PRODUCING pieces keep their status; the machine may finish them
        // anyway and they come back as free stock.
        let outcome = self.pieces.cancel_order(order_id).await?;

        // Ids recorded by an earlier attempt are sent again, so a retry after
        // a failed publish still reaches the machines.
        for piece_id in &outcome.cancelled_piece_ids {
            self.request_cancellation(*piece_id).await;
        }

        info!(
            order_id,
            cancelled = outcome.cancelled.len(),
            withdrawn = outcome.withdrawn.len(),
            returned_to_stock = outcome.returned.len(),
            "Order cancelled"
        );

        let event = OrderCancelled {
            order_id,
            cancelled_piece_ids: outcome.cancelled_piece_ids,
        };
        let message = OutboundMessage::json(
            self.topics.order_cancelled.clone(),
            Some(order_id.to_string()),
            &event,
        )?;
        self.publisher.publish(message).await?;
        Ok(event)
    }

    /// Best effort: the production subsystem may already be done with it.
    async fn request_cancellation(&self, piece_id: PieceId) {
        let sent = match OutboundMessage::json(
            self.topics.piece_cancel.clone(),
            Some(piece_id.to_string()),
            &PieceCancelRequest { piece_id },
        ) {
            Ok(message) => self.publisher.publish(message).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(piece_id, "Piece cancellation request not sent: {}", e);
        }
    }
}
