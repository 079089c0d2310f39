//! Fee and coupon definitions.
//!
//! The definition is stored as JSONB. Redemption counts live in their own column so a
//! checkout can hold one with a single conditional `UPDATE` instead of rewriting the
//! definition. The usage limit is checked in that same statement.

use crate::to_u64;
use boxoffice_core::error::ModifierError;
use boxoffice_core::modifier::{
    Modifier, ModifierCatalog, ModifierId, ModifierKind, ModifierRepository,
};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

fn storage(context: &str, error: &sqlx::Error) -> ModifierError {
    ModifierError::Storage(format!("{context}: {error}"))
}

fn to_db_id(id: ModifierId) -> Result<i64, ModifierError> {
    i64::try_from(id.value())
        .map_err(|_| ModifierError::Storage(format!("modifier id {id} does not fit BIGINT")))
}

/// `PostgreSQL` modifier repository.
#[derive(Clone, Debug)]
pub struct PostgresModifierRepository {
    pool: PgPool,
}

impl PostgresModifierRepository {
    /// Create a repository over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Adds or replaces a modifier definition.
    ///
    /// For coupons the stored redemption count is seeded from the definition on insert and
    /// left alone on update.
    ///
    /// # Errors
    ///
    /// Returns [`ModifierError::Storage`] if the write fails.
    pub async fn upsert(&self, modifier: &Modifier) -> Result<(), ModifierError> {
        let redeemed = match modifier.kind {
            ModifierKind::Coupon { times_redeemed, .. } => i64::from(times_redeemed),
            ModifierKind::Fee { .. } => 0,
        };
        sqlx::query(
            r"
            INSERT INTO modifiers (id, slug, definition, times_redeemed)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET slug = EXCLUDED.slug, definition = EXCLUDED.definition
            ",
        )
        .bind(to_db_id(modifier.id)?)
        .bind(&modifier.slug)
        .bind(Json(modifier))
        .bind(redeemed)
        .execute(&self.pool)
        .await
        .map_err(|e| storage("Failed to upsert modifier", &e))?;

        tracing::debug!(modifier_id = %modifier.id, slug = %modifier.slug, "Modifier stored");
        Ok(())
    }
}

impl ModifierRepository for PostgresModifierRepository {
    fn load_catalog(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<ModifierCatalog, ModifierError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query("SELECT definition, times_redeemed FROM modifiers ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage("Failed to load modifiers", &e))?;

            let mut catalog = ModifierCatalog::new();
            for row in rows {
                let Json(mut modifier): Json<Modifier> = row
                    .try_get("definition")
                    .map_err(|e| storage("Failed to decode modifier", &e))?;
                let redeemed: i64 = row
                    .try_get("times_redeemed")
                    .map_err(|e| storage("Failed to decode redemption count", &e))?;
                if let ModifierKind::Coupon { times_redeemed, .. } = &mut modifier.kind {
                    *times_redeemed = u32::try_from(to_u64(redeemed)).unwrap_or(u32::MAX);
                }
                catalog.insert(modifier);
            }
            Ok(catalog)
        })
    }

    fn reserve_redemption(
        &self,
        id: ModifierId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ModifierError>> + Send + '_>> {
        Box::pin(async move {
            let db_id = to_db_id(id)?;
            let held = sqlx::query(
                r"
                UPDATE modifiers
                SET times_redeemed = times_redeemed + 1
                WHERE id = $1
                  AND definition -> 'kind' ? 'Coupon'
                  AND (definition -> 'kind' -> 'Coupon' ->> 'usage_limit' IS NULL
                       OR times_redeemed < (definition -> 'kind' -> 'Coupon' ->> 'usage_limit')::BIGINT)
                RETURNING id
                ",
            )
            .bind(db_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("Failed to reserve redemption", &e))?;

            if held.is_some() {
                tracing::debug!(modifier_id = %id, "Coupon redemption held");
                return Ok(());
            }

            // Nothing updated: either not a coupon (ignored) or out of redemptions.
            let exhausted: Option<String> = sqlx::query_scalar(
                "SELECT slug FROM modifiers WHERE id = $1 AND definition -> 'kind' ? 'Coupon'",
            )
            .bind(db_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("Failed to look up coupon", &e))?;

            match exhausted {
                Some(slug) => {
                    tracing::info!(modifier_id = %id, slug = %slug, "Coupon has no redemptions left");
                    Err(ModifierError::CouponExhausted(slug))
                }
                None => Ok(()),
            }
        })
    }

    fn release_redemption(
        &self,
        id: ModifierId,
    ) -> Pin<Box<dyn Future<Output = Result<(), ModifierError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE modifiers
                SET times_redeemed = GREATEST(times_redeemed - 1, 0)
                WHERE id = $1 AND definition -> 'kind' ? 'Coupon'
                ",
            )
            .bind(to_db_id(id)?)
            .execute(&self.pool)
            .await
            .map_err(|e| storage("Failed to release redemption", &e))?;

            if result.rows_affected() == 1 {
                tracing::debug!(modifier_id = %id, "Coupon redemption released");
            }
            Ok(())
        })
    }
}
