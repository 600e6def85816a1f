use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type OrderId = i64;
pub type PieceId = i64;

/// Value of `public_key` announcing that the auth service rotated its key.
pub const PUBLIC_KEY_AVAILABLE: &str = "AVAILABLE";

/// Status carried by the order completion event.
pub const ORDER_PROCESSED: &str = "Processed";

pub mod topics {
    pub const RESERVE: &str = "warehouse.reserve";
    pub const RELEASE: &str = "warehouse.release";
    pub const CANCEL: &str = "warehouse.cancel";
    pub const PIECE_REQUEST: &str = "order.created";
    pub const PIECE_PRODUCING: &str = "machine.piece.producing";
    pub const PIECE_PRODUCED: &str = "machine.piece.produced";
    pub const PIECE_EXECUTED: &str = "machine.piece_executed";
    pub const PIECE_CANCELLED: &str = "machine.piece.cancelled";
    pub const PUBLIC_KEY: &str = "client.public_key.warehouse";

    pub const PRODUCE_PREFIX: &str = "machine.piece.produce";
    pub const PIECE_CANCEL: &str = "machine.piece.cancel";
    pub const ORDER_COMPLETED: &str = "order.status.update";
    pub const ORDER_CANCELLED: &str = "warehouse.cancelled";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PieceType {
    A,
    B,
}

impl PieceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PieceType::A => "A",
            PieceType::B => "B",
        }
    }
}

impl fmt::Display for PieceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown piece type '{0}'")]
pub struct UnknownPieceType(pub String);

impl FromStr for PieceType {
    type Err = UnknownPieceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" => Ok(PieceType::A),
            "B" => Ok(PieceType::B),
            other => Err(UnknownPieceType(other.to_string())),
        }
    }
}

/// Where a saga participant must send its reply. The coordinator picks the
/// topic and key per saga so concurrent sagas never share a reply channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseAddress {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveCommand {
    pub order_id: OrderId,
    pub response_address: ResponseAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseCommand {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelCommand {
    pub order_id: OrderId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceDemand {
    #[serde(rename = "type")]
    pub piece_type: PieceType,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceRequest {
    pub order_id: OrderId,
    pub pieces: Vec<PieceDemand>,
}

/// Lifecycle notification from the production subsystem.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PieceEvent {
    pub piece_id: PieceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyNotice {
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceRequest {
    pub piece_id: PieceId,
    pub piece_type: PieceType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceCancelRequest {
    pub piece_id: PieceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCompleted {
    pub order_id: OrderId,
    pub status: String,
}

impl OrderCompleted {
    pub fn processed(order_id: OrderId) -> Self {
        Self {
            order_id,
            status: ORDER_PROCESSED.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    #[serde(rename = "OK")]
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveReply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ReserveReply {
    pub fn ok() -> Self {
        Self {
            status: ReplyStatus::Ok,
            detail: None,
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            detail: Some(detail.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub cancelled_piece_ids: Vec<PieceId>,
}
