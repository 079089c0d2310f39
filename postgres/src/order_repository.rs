//! Order storage as a JSONB snapshot plus the columns lookups filter on.

use boxoffice_core::error::OrderError;
use boxoffice_core::gateway::GatewayRef;
use boxoffice_core::order::{Order, OrderId, OrderRepository, OrderStatus};
use boxoffice_core::stock::ReservationId;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

fn storage(context: &str, error: &sqlx::Error) -> OrderError {
    OrderError::Storage(format!("{context}: {error}"))
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<Order, OrderError> {
    let Json(order): Json<Order> = row
        .try_get("snapshot")
        .map_err(|e| storage("Failed to decode order snapshot", &e))?;
    Ok(order)
}

fn reservation_expiry(order: &Order) -> Option<DateTime<Utc>> {
    order.reservation.as_ref().map(|token| token.expires_at)
}

/// `PostgreSQL` order repository.
///
/// `update` is a compare-and-set on the `status` column, so two writers racing to move the
/// same order out of one status cannot both succeed. The reservation expiry is kept in its
/// own column so the janitor can find lapsed `Pending` orders without decoding snapshots.
#[derive(Clone, Debug)]
pub struct PostgresOrderRepository {
    pool: PgPool,
}

impl PostgresOrderRepository {
    /// Create a repository over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_one(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Option<Order>, OrderError> {
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("Failed to query orders", &e))?
            .as_ref()
            .map(decode)
            .transpose()
    }
}

impl OrderRepository for PostgresOrderRepository {
    fn insert(
        &self,
        order: Order,
    ) -> Pin<Box<dyn Future<Output = Result<(), OrderError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO orders (
                    id, status, gateway_id, gateway_order_ref, reservation_id,
                    reservation_expires_at, total_minor_units, snapshot, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ",
            )
            .bind(order.id.as_uuid())
            .bind(order.status.as_str())
            .bind(&order.gateway_id)
            .bind(order.gateway_order_ref.as_ref().map(GatewayRef::as_str))
            .bind(order.reservation_id().map(|id| *id.as_uuid()))
            .bind(reservation_expiry(&order))
            .bind(order.total.to_minor_units())
            .bind(Json(&order))
            .bind(order.created_at)
            .bind(order.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("Failed to insert order", &e))?;

            tracing::debug!(order_id = %order.id, status = %order.status, "Order stored");
            Ok(())
        })
    }

    fn get(
        &self,
        order_id: OrderId,
    ) -> Pin<Box<dyn Future<Output = Result<Order, OrderError>> + Send + '_>> {
        Box::pin(async move {
            self.find_one(
                sqlx::query("SELECT snapshot FROM orders WHERE id = $1").bind(*order_id.as_uuid()),
            )
            .await?
            .ok_or(OrderError::NotFound(order_id))
        })
    }

    fn find_by_gateway_ref(
        &self,
        gateway_id: String,
        reference: GatewayRef,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderError>> + Send + '_>> {
        Box::pin(async move {
            self.find_one(
                sqlx::query(
                    r"
                    SELECT snapshot FROM orders
                    WHERE gateway_id = $1 AND gateway_order_ref = $2
                    LIMIT 1
                    ",
                )
                .bind(gateway_id)
                .bind(reference.as_str().to_string()),
            )
            .await
        })
    }

    fn find_by_reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Order>, OrderError>> + Send + '_>> {
        Box::pin(async move {
            self.find_one(
                sqlx::query("SELECT snapshot FROM orders WHERE reservation_id = $1 LIMIT 1")
                    .bind(*reservation_id.as_uuid()),
            )
            .await
        })
    }

    fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Order>, OrderError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT snapshot FROM orders
                WHERE status = $1 AND reservation_expires_at <= $2
                ORDER BY reservation_expires_at
                ",
            )
            .bind(OrderStatus::Pending.as_str())
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage("Failed to query expired orders", &e))?;

            rows.iter().map(decode).collect()
        })
    }

    fn update(
        &self,
        order: Order,
        expected: OrderStatus,
    ) -> Pin<Box<dyn Future<Output = Result<(), OrderError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE orders
                SET status = $3,
                    gateway_order_ref = $4,
                    reservation_id = $5,
                    reservation_expires_at = $6,
                    snapshot = $7,
                    updated_at = $8
                WHERE id = $1 AND status = $2
                ",
            )
            .bind(order.id.as_uuid())
            .bind(expected.as_str())
            .bind(order.status.as_str())
            .bind(order.gateway_order_ref.as_ref().map(GatewayRef::as_str))
            .bind(order.reservation_id().map(|id| *id.as_uuid()))
            .bind(reservation_expiry(&order))
            .bind(Json(&order))
            .bind(order.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("Failed to update order", &e))?;

            if result.rows_affected() == 1 {
                return Ok(());
            }

            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM orders WHERE id = $1)")
                    .bind(order.id.as_uuid())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| storage("Failed to check order existence", &e))?;
            if exists {
                tracing::warn!(order_id = %order.id, expected = %expected, "Order status moved concurrently");
                Err(OrderError::ConcurrentModification {
                    order_id: order.id,
                    expected,
                })
            } else {
                Err(OrderError::NotFound(order.id))
            }
        })
    }
}
