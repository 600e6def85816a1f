use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::{OrderId, PieceId, PieceType};
use std::fmt;
use std::str::FromStr;

use crate::error::WarehouseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PieceStatus {
    Queued,
    Producing,
    Produced,
    Cancelled,
}

impl PieceStatus {
    pub const ALL: [PieceStatus; 4] = [
        PieceStatus::Queued,
        PieceStatus::Producing,
        PieceStatus::Produced,
        PieceStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PieceStatus::Queued => "QUEUED",
            PieceStatus::Producing => "PRODUCING",
            PieceStatus::Produced => "PRODUCED",
            PieceStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PieceStatus::Produced | PieceStatus::Cancelled)
    }
}

impl fmt::Display for PieceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PieceStatus {
    type Err = WarehouseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PieceStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| WarehouseError::CorruptRow(format!("unknown piece status '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Piece {
    pub id: PieceId,
    pub order_id: Option<OrderId>,
    pub piece_type: PieceType,
    pub status: PieceStatus,
    pub created_at: DateTime<Utc>,
    pub producing_started_at: Option<DateTime<Utc>>,
    pub produced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Piece {
    /// Finished and unattached, so any order of the same type may claim it.
    pub fn is_free(&self) -> bool {
        self.order_id.is_none() && self.status == PieceStatus::Produced
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewPiece {
    pub order_id: Option<OrderId>,
    pub piece_type: PieceType,
    pub status: PieceStatus,
}

impl NewPiece {
    pub fn queued(order_id: OrderId, piece_type: PieceType) -> Self {
        Self {
            order_id: Some(order_id),
            piece_type,
            status: PieceStatus::Queued,
        }
    }
}

/// The only fields of a piece that may change after insert. `None` leaves a
/// field untouched; `order_id: Some(None)` detaches the piece from its order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PieceUpdate {
    pub status: Option<PieceStatus>,
    pub order_id: Option<Option<OrderId>>,
}

impl PieceUpdate {
    pub fn status(status: PieceStatus) -> Self {
        Self {
            status: Some(status),
            order_id: None,
        }
    }

    pub fn detach() -> Self {
        Self {
            status: None,
            order_id: Some(None),
        }
    }

    pub fn cancel() -> Self {
        Self {
            status: Some(PieceStatus::Cancelled),
            order_id: Some(None),
        }
    }

    pub fn assign(order_id: OrderId) -> Self {
        Self {
            status: None,
            order_id: Some(Some(order_id)),
        }
    }

    pub fn apply(&self, piece: &mut Piece, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            piece.status = status;
            match status {
                PieceStatus::Producing => piece.producing_started_at = Some(now),
                PieceStatus::Produced => piece.produced_at = Some(now),
                _ => {}
            }
        }
        if let Some(order_id) = self.order_id {
            piece.order_id = order_id;
        }
        piece.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub reserved_units: i64,
    pub max_capacity: i64,
}

impl LedgerSnapshot {
    pub fn available(&self) -> i64 {
        self.max_capacity - self.reserved_units
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MovementKind {
    Reserve,
    Release,
}

impl MovementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementKind::Reserve => "RESERVE",
            MovementKind::Release => "RELEASE",
        }
    }
}

impl FromStr for MovementKind {
    type Err = WarehouseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESERVE" => Ok(MovementKind::Reserve),
            "RELEASE" => Ok(MovementKind::Release),
            other => Err(WarehouseError::CorruptRow(format!("unknown movement kind '{}'", other))),
        }
    }
}

/// Units an order still holds according to its ledger movements.
pub fn held_units(movements: impl IntoIterator<Item = (MovementKind, i64)>) -> i64 {
    movements
        .into_iter()
        .map(|(kind, units)| match kind {
            MovementKind::Reserve => units,
            MovementKind::Release => -units,
        })
        .sum::<i64>()
        .max(0)
}

/// Audit record of one applied ledger change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapacityMovement {
    pub order_id: OrderId,
    pub kind: MovementKind,
    pub requested_units: i64,
    pub applied_units: i64,
    pub reserved_after: i64,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::pieces)]
pub struct DbPiece {
    pub id: i64,
    pub order_id: Option<i64>,
    pub piece_type: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub producing_started_at: Option<DateTime<Utc>>,
    pub produced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::pieces)]
pub struct NewDbPiece<'a> {
    pub order_id: Option<i64>,
    pub piece_type: &'a str,
    pub status: &'a str,
}

#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::pieces)]
pub struct PieceChangeset<'a> {
    pub status: Option<&'a str>,
    pub order_id: Option<Option<i64>>,
    pub producing_started_at: Option<DateTime<Utc>>,
    pub produced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::warehouse)]
pub struct DbWarehouse {
    pub id: i32,
    pub reserved_units: i64,
    pub max_capacity: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::warehouse)]
pub struct NewDbWarehouse {
    pub id: i32,
    pub reserved_units: i64,
    pub max_capacity: i64,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::capacity_movements)]
pub struct NewDbCapacityMovement<'a> {
    pub warehouse_id: i32,
    pub order_id: i64,
    pub kind: &'a str,
    pub requested_units: i64,
    pub applied_units: i64,
    pub reserved_after: i64,
}

impl<'a> From<&'a NewPiece> for NewDbPiece<'a> {
    fn from(piece: &'a NewPiece) -> Self {
        Self {
            order_id: piece.order_id,
            piece_type: piece.piece_type.as_str(),
            status: piece.status.as_str(),
        }
    }
}

impl PieceChangeset<'static> {
    pub fn new(update: &PieceUpdate, now: DateTime<Utc>) -> Self {
        Self {
            status: update.status.map(|status| status.as_str()),
            order_id: update.order_id,
            producing_started_at: (update.status == Some(PieceStatus::Producing)).then_some(now),
            produced_at: (update.status == Some(PieceStatus::Produced)).then_some(now),
            updated_at: now,
        }
    }
}

impl TryFrom<DbPiece> for Piece {
    type Error = WarehouseError;

    fn try_from(row: DbPiece) -> Result<Self, Self::Error> {
        let piece_type = row
            .piece_type
            .parse::<PieceType>()
            .map_err(|e| WarehouseError::CorruptRow(e.to_string()))?;

        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            piece_type,
            status: row.status.parse()?,
            created_at: row.created_at,
            producing_started_at: row.producing_started_at,
            produced_at: row.produced_at,
            updated_at: row.updated_at,
        })
    }
}

impl From<DbWarehouse> for LedgerSnapshot {
    fn from(row: DbWarehouse) -> Self {
        Self {
            reserved_units: row.reserved_units,
            max_capacity: row.max_capacity,
        }
    }
}

impl<'a> NewDbCapacityMovement<'a> {
    pub fn new(warehouse_id: i32, movement: &'a CapacityMovement) -> Self {
        Self {
            warehouse_id,
            order_id: movement.order_id,
            kind: movement.kind.as_str(),
            requested_units: movement.requested_units,
            applied_units: movement.applied_units,
            reserved_after: movement.reserved_after,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_cancellations)]
pub struct NewDbOrderCancellation {
    pub order_id: i64,
    pub piece_id: i64,
}

pub fn into_pieces(rows: Vec<DbPiece>) -> Result<Vec<Piece>, WarehouseError> {
    rows.into_iter().map(Piece::try_from).collect()
}
