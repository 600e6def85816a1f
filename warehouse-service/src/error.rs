use diesel_async::pooled_connection::PoolError;
use shared::PieceId;
use std::fmt;
use thiserror::Error;

use crate::models::PieceStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Piece(PieceId),
    Ledger(i32),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Piece(id) => write!(f, "piece {}", id),
            Entity::Ledger(id) => write!(f, "capacity ledger {}", id),
        }
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("piece {piece_id} cannot move from {from} to {to}")]
    InvalidTransition {
        piece_id: PieceId,
        from: PieceStatus,
        to: PieceStatus,
    },

    #[error("capacity exceeded: requested {requested} units with {reserved} of {max_capacity} reserved")]
    CapacityExceeded {
        requested: i64,
        reserved: i64,
        max_capacity: i64,
    },

    #[error("{0} not found")]
    MissingEntity(Entity),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("malformed message on {topic}: {reason}")]
    Decode { topic: String, reason: String },

    #[error("public key refresh failed: {0}")]
    KeyRefresh(String),
}

/// What the transport should do with the message that produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Retrying cannot succeed; the message is consumed and logged.
    Drop,
    /// Leave the message for the transport to deliver again.
    Redeliver,
}

impl WarehouseError {
    pub fn disposition(&self) -> Disposition {
        match self {
            WarehouseError::InvalidTransition { .. }
            | WarehouseError::CapacityExceeded { .. }
            | WarehouseError::MissingEntity(_)
            | WarehouseError::CorruptRow(_)
            | WarehouseError::Decode { .. } => Disposition::Drop,
            WarehouseError::Database(_)
            | WarehouseError::Pool(_)
            | WarehouseError::Publish { .. }
            | WarehouseError::KeyRefresh(_) => Disposition::Redeliver,
        }
    }
}

impl From<bb8::RunError<PoolError>> for WarehouseError {
    fn from(e: bb8::RunError<PoolError>) -> Self {
        WarehouseError::Pool(e.to_string())
    }
}

pub type Result<T, E = WarehouseError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_rejections_are_not_retried() {
        let stale = WarehouseError::InvalidTransition {
            piece_id: 3,
            from: PieceStatus::Produced,
            to: PieceStatus::Produced,
        };
        assert_eq!(stale.disposition(), Disposition::Drop);
        assert_eq!(
            WarehouseError::MissingEntity(Entity::Piece(3)).disposition(),
            Disposition::Drop
        );
    }

    #[test]
    fn infrastructure_failures_are_redelivered() {
        let err = WarehouseError::Database(diesel::result::Error::BrokenTransactionManager);
        assert_eq!(err.disposition(), Disposition::Redeliver);
        assert_eq!(WarehouseError::Pool("timed out".into()).disposition(), Disposition::Redeliver);
    }

    #[test]
    fn messages_name_the_entity() {
        assert_eq!(
            WarehouseError::MissingEntity(Entity::Piece(9)).to_string(),
            "piece 9 not found"
        );
    }
}
