//! Webhook idempotency records keyed by the provider's event id.

use boxoffice_core::error::WebhookError;
use boxoffice_core::order::OrderId;
use boxoffice_core::webhook::{RecordOutcome, WebhookEventRecord, WebhookEventStore};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

const COLUMNS: &str =
    "external_event_id, gateway_id, order_id, event_type, payload, received_at, processed_at";

fn storage(context: &str, error: &sqlx::Error) -> WebhookError {
    WebhookError::Storage(format!("{context}: {error}"))
}

fn decode(row: &PgRow) -> Result<WebhookEventRecord, WebhookError> {
    let column = |e: sqlx::Error| storage("Failed to decode webhook record", &e);
    let order_id: Option<uuid::Uuid> = row.try_get("order_id").map_err(column)?;
    let Json(payload): Json<serde_json::Value> = row.try_get("payload").map_err(column)?;
    Ok(WebhookEventRecord {
        external_event_id: row.try_get("external_event_id").map_err(column)?,
        gateway_id: row.try_get("gateway_id").map_err(column)?,
        order_id: order_id.map(OrderId::from_uuid),
        event_type: row.try_get("event_type").map_err(column)?,
        payload,
        received_at: row.try_get("received_at").map_err(column)?,
        processed_at: row.try_get("processed_at").map_err(column)?,
    })
}

/// `PostgreSQL` webhook event store.
#[derive(Clone, Debug)]
pub struct PostgresWebhookStore {
    pool: PgPool,
}

impl PostgresWebhookStore {
    /// Create a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load(&self, external_event_id: &str) -> Result<Option<WebhookEventRecord>, WebhookError> {
        sqlx::query(&format!(
            "SELECT {COLUMNS} FROM webhook_events WHERE external_event_id = $1"
        ))
        .bind(external_event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage("Failed to load webhook record", &e))?
        .as_ref()
        .map(decode)
        .transpose()
    }
}

impl WebhookEventStore for PostgresWebhookStore {
    fn record(
        &self,
        record: WebhookEventRecord,
    ) -> Pin<Box<dyn Future<Output = Result<RecordOutcome, WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let inserted = sqlx::query(
                r"
                INSERT INTO webhook_events (
                    external_event_id, gateway_id, order_id, event_type,
                    payload, received_at, processed_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (external_event_id) DO NOTHING
                RETURNING external_event_id
                ",
            )
            .bind(&record.external_event_id)
            .bind(&record.gateway_id)
            .bind(record.order_id.map(|id| *id.as_uuid()))
            .bind(&record.event_type)
            .bind(Json(&record.payload))
            .bind(record.received_at)
            .bind(record.processed_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("Failed to record webhook", &e))?;

            if inserted.is_some() {
                return Ok(RecordOutcome::New(record));
            }

            tracing::debug!(
                external_event_id = %record.external_event_id,
                "Webhook event already recorded"
            );
            let existing = self
                .load(&record.external_event_id)
                .await?
                .ok_or_else(|| {
                    WebhookError::Storage(format!(
                        "webhook record '{}' vanished after conflict",
                        record.external_event_id
                    ))
                })?;
            Ok(RecordOutcome::Duplicate(existing))
        })
    }

    fn mark_processed(
        &self,
        external_event_id: String,
        order_id: Option<OrderId>,
        processed_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE webhook_events
                SET processed_at = $2,
                    order_id = COALESCE($3, order_id)
                WHERE external_event_id = $1
                ",
            )
            .bind(&external_event_id)
            .bind(processed_at)
            .bind(order_id.map(|id| *id.as_uuid()))
            .execute(&self.pool)
            .await
            .map_err(|e| storage("Failed to mark webhook processed", &e))?;

            if result.rows_affected() == 0 {
                return Err(WebhookError::Storage(format!(
                    "no webhook record '{external_event_id}'"
                )));
            }
            Ok(())
        })
    }

    fn get(
        &self,
        external_event_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<Option<WebhookEventRecord>, WebhookError>> + Send + '_>>
    {
        Box::pin(async move { self.load(&external_event_id).await })
    }

    fn evict_unprocessed_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, WebhookError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "DELETE FROM webhook_events WHERE processed_at IS NULL AND received_at < $1",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("Failed to evict webhook records", &e))?;

            let evicted = result.rows_affected();
            if evicted > 0 {
                tracing::info!(evicted, "Evicted unmatched webhook records");
            }
            Ok(evicted)
        })
    }
}
