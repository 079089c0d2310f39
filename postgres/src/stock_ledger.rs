//! Stock ledger backed by `stock_groups` and `stock_reservations`.
//!
//! Every multi-group operation runs in one transaction that locks the affected group rows
//! with `SELECT ... ORDER BY group_key FOR UPDATE`. Sorted locking means two checkouts
//! touching overlapping groups queue behind each other instead of deadlocking. Operations
//! on an existing reservation lock the reservation row first, then its groups.

use crate::{to_i64, to_u64};
use boxoffice_core::error::StockError;
use boxoffice_core::metrics;
use boxoffice_core::stock::{
    ReservationId, ReservationState, ReservationToken, StockGroupKey, StockLedger, StockRecord,
    StockRequest, UNLIMITED, normalize_requests,
};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

fn storage(context: &str, error: &sqlx::Error) -> StockError {
    StockError::Storage(format!("{context}: {error}"))
}

/// `PostgreSQL` stock ledger.
#[derive(Clone, Debug)]
pub struct PostgresStockLedger {
    pool: PgPool,
}

impl PostgresStockLedger {
    /// Create a ledger over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Locks the rows for `keys` (already sorted and unique) and returns them in key order.
    async fn lock_groups(
        tx: &mut Transaction<'_, Postgres>,
        keys: &[StockGroupKey],
    ) -> Result<Vec<StockRecord>, StockError> {
        let wanted: Vec<String> = keys.iter().map(|k| k.as_str().to_string()).collect();
        let rows = sqlx::query(
            r"
            SELECT group_key, capacity, committed, reserved
            FROM stock_groups
            WHERE group_key = ANY($1)
            ORDER BY group_key
            FOR UPDATE
            ",
        )
        .bind(&wanted)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| storage("Failed to lock stock groups", &e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.try_get("group_key").map_err(|e| storage("group_key", &e))?;
            records.push(StockRecord {
                group_key: StockGroupKey::new(key),
                capacity: row.try_get("capacity").map_err(|e| storage("capacity", &e))?,
                committed: to_u64(row.try_get("committed").map_err(|e| storage("committed", &e))?),
                reserved: to_u64(row.try_get("reserved").map_err(|e| storage("reserved", &e))?),
            });
        }

        if let Some(missing) = keys
            .iter()
            .find(|key| !records.iter().any(|r| &r.group_key == *key))
        {
            return Err(StockError::UnknownGroup(missing.clone()));
        }
        Ok(records)
    }

    /// Applies signed deltas to `reserved` and `committed` for one group.
    async fn adjust(
        tx: &mut Transaction<'_, Postgres>,
        key: &StockGroupKey,
        reserved_delta: i64,
        committed_delta: i64,
    ) -> Result<(), StockError> {
        sqlx::query(
            r"
            UPDATE stock_groups
            SET reserved = GREATEST(reserved + $2, 0),
                committed = GREATEST(committed + $3, 0)
            WHERE group_key = $1
            ",
        )
        .bind(key.as_str())
        .bind(reserved_delta)
        .bind(committed_delta)
        .execute(&mut **tx)
        .await
        .map_err(|e| storage("Failed to update stock group", &e))?;
        Ok(())
    }

    /// Locks a reservation row and returns its state and lines.
    async fn lock_reservation(
        tx: &mut Transaction<'_, Postgres>,
        reservation_id: ReservationId,
    ) -> Result<(ReservationState, Vec<StockRequest>), StockError> {
        let row = sqlx::query(
            "SELECT state, lines FROM stock_reservations WHERE id = $1 FOR UPDATE",
        )
        .bind(reservation_id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| storage("Failed to lock reservation", &e))?
        .ok_or(StockError::UnknownReservation(reservation_id))?;

        let state: String = row.try_get("state").map_err(|e| storage("state", &e))?;
        let Json(lines): Json<Vec<StockRequest>> =
            row.try_get("lines").map_err(|e| storage("lines", &e))?;
        let state = ReservationState::parse(&state)
            .ok_or_else(|| StockError::Storage(format!("Invalid reservation state: {state}")))?;
        Ok((state, lines))
    }

    async fn set_state(
        tx: &mut Transaction<'_, Postgres>,
        reservation_id: ReservationId,
        state: ReservationState,
    ) -> Result<(), StockError> {
        sqlx::query("UPDATE stock_reservations SET state = $2 WHERE id = $1")
            .bind(reservation_id.as_uuid())
            .bind(state.as_str())
            .execute(&mut **tx)
            .await
            .map_err(|e| storage("Failed to update reservation", &e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StockError> {
        self.pool
            .begin()
            .await
            .map_err(|e| storage("Failed to start transaction", &e))
    }

    async fn finish(tx: Transaction<'_, Postgres>) -> Result<(), StockError> {
        tx.commit()
            .await
            .map_err(|e| storage("Failed to commit transaction", &e))
    }

    /// Moves a held reservation out of `reserved`, into `committed` if `commit` is set.
    async fn close(
        &self,
        reservation_id: ReservationId,
        commit: bool,
    ) -> Result<bool, StockError> {
        let mut tx = self.begin().await?;
        let (state, lines) = Self::lock_reservation(&mut tx, reservation_id).await?;
        match (state, commit) {
            (ReservationState::Held, _) => {}
            (ReservationState::Committed, true) | (_, false) => return Ok(false),
            (ReservationState::Released, true) => {
                return Err(StockError::ReservationExpired(reservation_id));
            }
        }

        let keys: Vec<StockGroupKey> = lines.iter().map(|l| l.group_key.clone()).collect();
        Self::lock_groups(&mut tx, &keys).await?;
        for line in &lines {
            let quantity = to_i64(line.quantity);
            let committed = if commit { quantity } else { 0 };
            Self::adjust(&mut tx, &line.group_key, -quantity, committed).await?;
        }
        let next = if commit {
            ReservationState::Committed
        } else {
            ReservationState::Released
        };
        Self::set_state(&mut tx, reservation_id, next).await?;
        Self::finish(tx).await?;
        Ok(true)
    }
}

impl StockLedger for PostgresStockLedger {
    fn define_group(
        &self,
        group_key: StockGroupKey,
        capacity: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>> {
        Box::pin(async move {
            if capacity < UNLIMITED {
                return Err(StockError::InvalidQuantity(format!(
                    "capacity {capacity} for '{group_key}'"
                )));
            }
            sqlx::query(
                r"
                INSERT INTO stock_groups (group_key, capacity)
                VALUES ($1, $2)
                ON CONFLICT (group_key) DO UPDATE SET capacity = EXCLUDED.capacity
                ",
            )
            .bind(group_key.as_str())
            .bind(capacity)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("Failed to define stock group", &e))?;
            tracing::debug!(group_key = %group_key, capacity, "Stock group defined");
            Ok(())
        })
    }

    fn validate_and_reserve(
        &self,
        requests: Vec<StockRequest>,
        expires_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<ReservationToken, StockError>> + Send + '_>> {
        Box::pin(async move {
            let lines = normalize_requests(requests)?;
            let keys: Vec<StockGroupKey> = lines.iter().map(|l| l.group_key.clone()).collect();

            let mut tx = self.begin().await?;
            let records = Self::lock_groups(&mut tx, &keys).await?;

            for (line, record) in lines.iter().zip(&records) {
                if let Err(error) = record.ensure_available(line.quantity) {
                    tracing::info!(
                        group_key = %line.group_key,
                        requested = line.quantity,
                        "Reservation rejected: insufficient stock"
                    );
                    metrics::record_sold_out();
                    // Dropping the transaction rolls it back.
                    return Err(error);
                }
            }
            for line in &lines {
                Self::adjust(&mut tx, &line.group_key, to_i64(line.quantity), 0).await?;
            }

            let id = ReservationId::new();
            sqlx::query(
                r"
                INSERT INTO stock_reservations (id, lines, expires_at, state)
                VALUES ($1, $2, $3, $4)
                ",
            )
            .bind(id.as_uuid())
            .bind(Json(&lines))
            .bind(expires_at)
            .bind(ReservationState::Held.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| storage("Failed to insert reservation", &e))?;
            Self::finish(tx).await?;

            metrics::record_reservation_held();
            tracing::info!(reservation_id = %id, groups = lines.len(), "Stock reserved");
            Ok(ReservationToken {
                id,
                lines,
                expires_at,
            })
        })
    }

    fn commit(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>> {
        Box::pin(async move {
            if self.close(reservation_id, true).await? {
                metrics::record_reservation_closed("committed");
                tracing::info!(reservation_id = %reservation_id, "Reservation committed");
            }
            Ok(())
        })
    }

    fn release(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>> {
        Box::pin(async move {
            if self.close(reservation_id, false).await? {
                metrics::record_reservation_closed("released");
                tracing::info!(reservation_id = %reservation_id, "Reservation released");
            }
            Ok(())
        })
    }

    fn release_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ReservationId>, StockError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.begin().await?;
            let rows = sqlx::query(
                r"
                SELECT id, lines
                FROM stock_reservations
                WHERE state = 'held' AND expires_at <= $1
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                ",
            )
            .bind(now)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| storage("Failed to select expired reservations", &e))?;

            let mut released = Vec::with_capacity(rows.len());
            let mut totals: BTreeMap<StockGroupKey, u64> = BTreeMap::new();
            for row in rows {
                let id: uuid::Uuid = row.try_get("id").map_err(|e| storage("id", &e))?;
                let Json(lines): Json<Vec<StockRequest>> =
                    row.try_get("lines").map_err(|e| storage("lines", &e))?;
                for line in lines {
                    *totals.entry(line.group_key).or_default() += line.quantity;
                }
                released.push(ReservationId::from_uuid(id));
            }
            if released.is_empty() {
                return Ok(released);
            }

            let keys: Vec<StockGroupKey> = totals.keys().cloned().collect();
            Self::lock_groups(&mut tx, &keys).await?;
            for (key, quantity) in &totals {
                Self::adjust(&mut tx, key, -to_i64(*quantity), 0).await?;
            }
            let ids: Vec<uuid::Uuid> = released.iter().map(|id| *id.as_uuid()).collect();
            sqlx::query("UPDATE stock_reservations SET state = 'released' WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await
                .map_err(|e| storage("Failed to release reservations", &e))?;
            Self::finish(tx).await?;

            for id in &released {
                metrics::record_reservation_closed("expired");
                tracing::info!(reservation_id = %id, "Expired reservation released");
            }
            Ok(released)
        })
    }

    fn restock(
        &self,
        lines: Vec<StockRequest>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StockError>> + Send + '_>> {
        Box::pin(async move {
            let lines = normalize_requests(lines)?;
            let keys: Vec<StockGroupKey> = lines.iter().map(|l| l.group_key.clone()).collect();
            let mut tx = self.begin().await?;
            Self::lock_groups(&mut tx, &keys).await?;
            for line in &lines {
                Self::adjust(&mut tx, &line.group_key, 0, -to_i64(line.quantity)).await?;
                tracing::info!(
                    group_key = %line.group_key,
                    quantity = line.quantity,
                    "Stock returned to availability"
                );
            }
            Self::finish(tx).await
        })
    }

    fn record(
        &self,
        group_key: StockGroupKey,
    ) -> Pin<Box<dyn Future<Output = Result<StockRecord, StockError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT capacity, committed, reserved FROM stock_groups WHERE group_key = $1",
            )
            .bind(group_key.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("Failed to load stock group", &e))?
            .ok_or_else(|| StockError::UnknownGroup(group_key.clone()))?;

            Ok(StockRecord {
                capacity: row.try_get("capacity").map_err(|e| storage("capacity", &e))?,
                committed: to_u64(row.try_get("committed").map_err(|e| storage("committed", &e))?),
                reserved: to_u64(row.try_get("reserved").map_err(|e| storage("reserved", &e))?),
                group_key,
            })
        })
    }
}
