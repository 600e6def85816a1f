use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::{OrderId, PieceId, PieceType};
use tracing::{debug, warn};

use crate::error::{Entity, Result, WarehouseError};
use crate::models::*;
use crate::schema::*;
use crate::store::{CapacityLedger, OrderCancellation, OrderTransition, PieceStore, ReleaseOutcome};

pub type DbPool = Pool<AsyncPgConnection>;

/// Piece table and capacity ledger backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    warehouse_id: i32,
}

impl PgStore {
    pub fn new(pool: DbPool, warehouse_id: i32) -> Self {
        Self { pool, warehouse_id }
    }

    /// Creates the ledger row on first start and applies the configured
    /// ceiling, unless more than that is already reserved.
    pub async fn ensure_ledger(&self, max_capacity: i64) -> Result<LedgerSnapshot> {
        let mut conn = self.pool.get().await?;

        diesel::insert_into(warehouse::table)
            .values(&NewDbWarehouse {
                id: self.warehouse_id,
                reserved_units: 0,
                max_capacity,
            })
            .on_conflict(warehouse::id)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        let updated = diesel::update(
            warehouse::table
                .filter(warehouse::id.eq(self.warehouse_id))
                .filter(warehouse::reserved_units.le(max_capacity)),
        )
        .set((
            warehouse::max_capacity.eq(max_capacity),
            warehouse::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;

        let row = warehouse::table
            .filter(warehouse::id.eq(self.warehouse_id))
            .first::<DbWarehouse>(&mut conn)
            .await?;

        if updated == 0 {
            warn!(
                warehouse_id = self.warehouse_id,
                reserved_units = row.reserved_units,
                max_capacity,
                "Configured capacity is below current reservations, keeping stored ceiling"
            );
        }

        Ok(row.into())
    }
}

fn status_names(statuses: &[PieceStatus]) -> Vec<&'static str> {
    statuses.iter().map(|status| status.as_str()).collect()
}

async fn load_order(conn: &mut AsyncPgConnection, order_id: OrderId) -> Result<Vec<Piece>> {
    let rows = pieces::table
        .filter(pieces::order_id.eq(order_id))
        .order(pieces::id.asc())
        .load::<DbPiece>(conn)
        .await?;
    into_pieces(rows)
}

/// Row locks on every piece of the order, always taken in id order.
async fn lock_order(conn: &mut AsyncPgConnection, order_id: OrderId) -> Result<()> {
    pieces::table
        .filter(pieces::order_id.eq(order_id))
        .select(pieces::id)
        .order(pieces::id.asc())
        .for_update()
        .load::<i64>(conn)
        .await?;
    Ok(())
}

async fn update_order(
    conn: &mut AsyncPgConnection,
    order_id: OrderId,
    from: &[PieceStatus],
    update: &PieceUpdate,
) -> Result<Vec<Piece>> {
    let changes = PieceChangeset::new(update, Utc::now());
    let rows = diesel::update(
        pieces::table
            .filter(pieces::order_id.eq(order_id))
            .filter(pieces::status.eq_any(status_names(from))),
    )
    .set(&changes)
    .get_results::<DbPiece>(conn)
    .await?;

    let mut pieces = into_pieces(rows)?;
    pieces.sort_by_key(|piece| piece.id);
    Ok(pieces)
}

async fn transition_row(
    conn: &mut AsyncPgConnection,
    piece_id: PieceId,
    from: &[PieceStatus],
    update: &PieceUpdate,
) -> Result<Option<Piece>> {
    let changes = PieceChangeset::new(update, Utc::now());
    let row = diesel::update(
        pieces::table
            .filter(pieces::id.eq(piece_id))
            .filter(pieces::status.eq_any(status_names(from))),
    )
    .set(&changes)
    .get_result::<DbPiece>(conn)
    .await
    .optional()?;

    row.map(Piece::try_from).transpose()
}

async fn lock_ledger(conn: &mut AsyncPgConnection, warehouse_id: i32) -> Result<DbWarehouse> {
    warehouse::table
        .filter(warehouse::id.eq(warehouse_id))
        .for_update()
        .first::<DbWarehouse>(conn)
        .await
        .optional()?
        .ok_or(WarehouseError::MissingEntity(Entity::Ledger(warehouse_id)))
}

async fn held_by(conn: &mut AsyncPgConnection, warehouse_id: i32, order_id: OrderId) -> Result<i64> {
    let rows = capacity_movements::table
        .filter(capacity_movements::warehouse_id.eq(warehouse_id))
        .filter(capacity_movements::order_id.eq(order_id))
        .select((capacity_movements::kind, capacity_movements::applied_units))
        .load::<(String, i64)>(conn)
        .await?;

    let movements = rows
        .into_iter()
        .map(|(kind, units)| Ok((kind.parse::<MovementKind>()?, units)))
        .collect::<Result<Vec<_>>>()?;
    Ok(held_units(movements))
}

async fn record_movement(
    conn: &mut AsyncPgConnection,
    warehouse_id: i32,
    movement: &CapacityMovement,
) -> Result<()> {
    diesel::insert_into(capacity_movements::table)
        .values(&NewDbCapacityMovement::new(warehouse_id, movement))
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl PieceStore for PgStore {
    async fn create_piece(&self, piece: NewPiece) -> Result<Piece> {
        let mut conn = self.pool.get().await?;
        let row = diesel::insert_into(pieces::table)
            .values(&NewDbPiece::from(&piece))
            .get_result::<DbPiece>(&mut conn)
            .await?;
        Piece::try_from(row)
    }

    async fn get_piece(&self, piece_id: PieceId) -> Result<Option<Piece>> {
        let mut conn = self.pool.get().await?;
        let row = pieces::table
            .filter(pieces::id.eq(piece_id))
            .first::<DbPiece>(&mut conn)
            .await
            .optional()?;
        row.map(Piece::try_from).transpose()
    }

    async fn list_pieces(&self) -> Result<Vec<Piece>> {
        let mut conn = self.pool.get().await?;
        let rows = pieces::table
            .order(pieces::id.asc())
            .load::<DbPiece>(&mut conn)
            .await?;
        into_pieces(rows)
    }

    async fn pieces_by_order(&self, order_id: OrderId) -> Result<Vec<Piece>> {
        let mut conn = self.pool.get().await?;
        load_order(&mut conn, order_id).await
    }

    async fn pieces_by_status(&self, status: PieceStatus) -> Result<Vec<Piece>> {
        let mut conn = self.pool.get().await?;
        let rows = pieces::table
            .filter(pieces::status.eq(status.as_str()))
            .order(pieces::id.asc())
            .load::<DbPiece>(&mut conn)
            .await?;
        into_pieces(rows)
    }

    async fn count_by_order(&self, order_id: OrderId, statuses: &[PieceStatus]) -> Result<i64> {
        let mut conn = self.pool.get().await?;
        let count = pieces::table
            .filter(pieces::order_id.eq(order_id))
            .filter(pieces::status.eq_any(status_names(statuses)))
            .count()
            .get_result::<i64>(&mut conn)
            .await?;
        Ok(count)
    }

    async fn transition(
        &self,
        piece_id: PieceId,
        from: &[PieceStatus],
        update: PieceUpdate,
    ) -> Result<Option<Piece>> {
        let mut conn = self.pool.get().await?;
        transition_row(&mut conn, piece_id, from, &update).await
    }

    async fn transition_in_order(
        &self,
        piece_id: PieceId,
        from: &[PieceStatus],
        update: PieceUpdate,
    ) -> Result<Option<OrderTransition>> {
        let mut conn = self.pool.get().await?;
        let from = from.to_vec();

        conn.transaction::<_, WarehouseError, _>(|conn| {
            Box::pin(async move {
                let order_id = pieces::table
                    .filter(pieces::id.eq(piece_id))
                    .select(pieces::order_id)
                    .first::<Option<i64>>(conn)
                    .await
                    .optional()?;

                let Some(order_id) = order_id else {
                    return Ok(None);
                };

                // Siblings are locked in id order; a second producer of the
                // same order waits here and then sees this commit.
                if let Some(order_id) = order_id {
                    lock_order(conn, order_id).await?;
                }

                let Some(piece) = transition_row(conn, piece_id, &from, &update).await? else {
                    return Ok(None);
                };

                let order_pieces = match piece.order_id {
                    Some(order_id) => load_order(conn, order_id).await?,
                    None => Vec::new(),
                };

                Ok(Some(OrderTransition { piece, order_pieces }))
            })
        })
        .await
    }

    async fn transition_order(
        &self,
        order_id: OrderId,
        from: &[PieceStatus],
        update: PieceUpdate,
    ) -> Result<Vec<Piece>> {
        let mut conn = self.pool.get().await?;
        let from = from.to_vec();

        conn.transaction::<_, WarehouseError, _>(|conn| {
            Box::pin(async move {
                lock_order(conn, order_id).await?;
                update_order(conn, order_id, &from, &update).await
            })
        })
        .await
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<OrderCancellation> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, WarehouseError, _>(|conn| {
            Box::pin(async move {
                lock_order(conn, order_id).await?;

                let cancelled =
                    update_order(conn, order_id, &[PieceStatus::Queued], &PieceUpdate::cancel())
                        .await?;
                let withdrawn =
                    update_order(conn, order_id, &[PieceStatus::Producing], &PieceUpdate::detach())
                        .await?;
                let returned =
                    update_order(conn, order_id, &[PieceStatus::Produced], &PieceUpdate::detach())
                        .await?;

                let records: Vec<NewDbOrderCancellation> = cancelled
                    .iter()
                    .chain(&withdrawn)
                    .map(|piece| NewDbOrderCancellation {
                        order_id,
                        piece_id: piece.id,
                    })
                    .collect();
                if !records.is_empty() {
                    diesel::insert_into(order_cancellations::table)
                        .values(&records)
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .await?;
                }

                let cancelled_piece_ids = order_cancellations::table
                    .filter(order_cancellations::order_id.eq(order_id))
                    .select(order_cancellations::piece_id)
                    .order(order_cancellations::piece_id.asc())
                    .load::<i64>(conn)
                    .await?;

                Ok(OrderCancellation {
                    cancelled,
                    withdrawn,
                    returned,
                    cancelled_piece_ids,
                })
            })
        })
        .await
    }

    async fn claim_free(
        &self,
        order_id: OrderId,
        piece_type: PieceType,
        limit: i64,
    ) -> Result<Vec<Piece>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, WarehouseError, _>(|conn| {
            Box::pin(async move {
                let candidates = pieces::table
                    .select(pieces::id)
                    .filter(pieces::order_id.is_null())
                    .filter(pieces::status.eq(PieceStatus::Produced.as_str()))
                    .filter(pieces::piece_type.eq(piece_type.as_str()))
                    .order(pieces::id.asc())
                    .limit(limit)
                    .for_update()
                    .skip_locked()
                    .load::<i64>(conn)
                    .await?;

                if candidates.is_empty() {
                    return Ok(Vec::new());
                }

                let changes = PieceChangeset::new(&PieceUpdate::assign(order_id), Utc::now());
                let rows = diesel::update(
                    pieces::table
                        .filter(pieces::id.eq_any(candidates))
                        .filter(pieces::order_id.is_null()),
                )
                .set(&changes)
                .get_results::<DbPiece>(conn)
                .await?;

                let mut claimed = into_pieces(rows)?;
                claimed.sort_by_key(|piece| piece.id);
                debug!(order_id, %piece_type, claimed = claimed.len(), "Claimed free pieces");
                Ok(claimed)
            })
        })
        .await
    }
}

#[async_trait]
impl CapacityLedger for PgStore {
    async fn snapshot(&self) -> Result<LedgerSnapshot> {
        let mut conn = self.pool.get().await?;
        let row = warehouse::table
            .filter(warehouse::id.eq(self.warehouse_id))
            .first::<DbWarehouse>(&mut conn)
            .await
            .optional()?
            .ok_or(WarehouseError::MissingEntity(Entity::Ledger(self.warehouse_id)))?;
        Ok(row.into())
    }

    async fn try_reserve(
        &self,
        order_id: OrderId,
        amount: i64,
        max_capacity: i64,
    ) -> Result<LedgerSnapshot> {
        if amount <= 0 {
            return self.snapshot().await;
        }
        let warehouse_id = self.warehouse_id;
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, WarehouseError, _>(|conn| {
            Box::pin(async move {
                let current = lock_ledger(conn, warehouse_id).await?;
                if held_by(conn, warehouse_id, order_id).await? > 0 {
                    debug!(order_id, "Order already holds a reservation");
                    return Ok(current.into());
                }

                let ceiling = max_capacity.min(current.max_capacity);
                if current.reserved_units + amount > ceiling {
                    return Err(WarehouseError::CapacityExceeded {
                        requested: amount,
                        reserved: current.reserved_units,
                        max_capacity,
                    });
                }

                let row = diesel::update(warehouse::table.filter(warehouse::id.eq(warehouse_id)))
                    .set((
                        warehouse::reserved_units.eq(current.reserved_units + amount),
                        warehouse::updated_at.eq(Utc::now()),
                    ))
                    .get_result::<DbWarehouse>(conn)
                    .await?;

                let movement = CapacityMovement {
                    order_id,
                    kind: MovementKind::Reserve,
                    requested_units: amount,
                    applied_units: amount,
                    reserved_after: row.reserved_units,
                };
                record_movement(conn, warehouse_id, &movement).await?;

                Ok(row.into())
            })
        })
        .await
    }

    async fn release(&self, order_id: OrderId, amount: i64) -> Result<ReleaseOutcome> {
        if amount <= 0 {
            return Ok(ReleaseOutcome {
                snapshot: self.snapshot().await?,
                released: 0,
                clamped: false,
            });
        }
        let warehouse_id = self.warehouse_id;
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, WarehouseError, _>(|conn| {
            Box::pin(async move {
                let current = lock_ledger(conn, warehouse_id).await?;
                let held = held_by(conn, warehouse_id, order_id).await?;
                let released = amount.min(held).min(current.reserved_units);
                if released == 0 {
                    return Ok(ReleaseOutcome {
                        snapshot: current.into(),
                        released: 0,
                        clamped: true,
                    });
                }

                let row = diesel::update(warehouse::table.filter(warehouse::id.eq(warehouse_id)))
                    .set((
                        warehouse::reserved_units.eq(current.reserved_units - released),
                        warehouse::updated_at.eq(Utc::now()),
                    ))
                    .get_result::<DbWarehouse>(conn)
                    .await?;

                let movement = CapacityMovement {
                    order_id,
                    kind: MovementKind::Release,
                    requested_units: amount,
                    applied_units: released,
                    reserved_after: row.reserved_units,
                };
                record_movement(conn, warehouse_id, &movement).await?;

                Ok(ReleaseOutcome {
                    snapshot: row.into(),
                    released,
                    clamped: released < amount,
                })
            })
        })
        .await
    }
}
