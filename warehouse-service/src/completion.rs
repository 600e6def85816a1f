use std::sync::Arc;

use shared::{OrderCompleted, OrderId};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{Piece, PieceStatus};
use crate::publisher::{EventPublisher, OutboundMessage};

/// Emits the order completion event once every piece of an order is produced.
#[derive(Clone)]
pub struct OrderCompletionWatcher {
    publisher: Arc<dyn EventPublisher>,
    topic: String,
}

impl OrderCompletionWatcher {
    pub fn new(publisher: Arc<dyn EventPublisher>, topic: String) -> Self {
        Self { publisher, topic }
    }

    /// An order without pieces is never complete.
    pub fn is_complete(pieces: &[Piece]) -> bool {
        !pieces.is_empty() && pieces.iter().all(|piece| piece.status == PieceStatus::Produced)
    }

    /// `pieces` must be the order's pieces as read by the transaction that
    /// recorded the triggering change. Returns whether an event was sent.
    pub async fn check(&self, order_id: OrderId, pieces: &[Piece]) -> Result<bool> {
        if !Self::is_complete(pieces) {
            debug!(
                order_id,
                pending = pieces.iter().filter(|p| p.status != PieceStatus::Produced).count(),
                "Order not complete yet"
            );
            return Ok(false);
        }
        self.notify(order_id).await?;
        Ok(true)
    }

    async fn notify(&self, order_id: OrderId) -> Result<()> {
        let message = OutboundMessage::json(
            self.topic.clone(),
            Some(order_id.to_string()),
            &OrderCompleted::processed(order_id),
        )?;
        self.publisher.publish(message).await?;
        info!(order_id, "Order completed");
        Ok(())
    }
}
