//! Quota counter store, PostgreSQL backend

use async_trait::async_trait;
use chrono::NaiveDate;
use dripline_common::types::UserId;
use dripline_common::{Error, Result};
use sqlx::PgPool;

use crate::models::QuotaCounter;
use crate::store::QuotaStore;

#[derive(Clone)]
pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn get(&self, user_id: UserId, date: NaiveDate) -> Result<Option<QuotaCounter>> {
        sqlx::query_as::<_, QuotaCounter>(
            "SELECT * FROM quota_counters WHERE user_id = $1 AND date = $2",
        )
        .bind(user_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn try_reserve(
        &self,
        user_id: UserId,
        date: NaiveDate,
        count: i32,
        limit: i32,
        allow_partial: bool,
    ) -> Result<i32> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Ensure the row exists, then lock it. The row lock makes the
        // read-compute-write below safe against concurrent reservers.
        sqlx::query(
            r#"
            INSERT INTO quota_counters (user_id, date, used, limit_value)
            VALUES ($1, $2, 0, $3)
            ON CONFLICT (user_id, date) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(limit)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let (used,): (i32,) = sqlx::query_as(
            "SELECT used FROM quota_counters WHERE user_id = $1 AND date = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(date)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let remaining = (limit - used).max(0);
        let granted = if allow_partial {
            count.min(remaining)
        } else if count <= remaining {
            count
        } else {
            0
        };

        if granted > 0 {
            sqlx::query(
                r#"
                UPDATE quota_counters SET
                    used = used + $3,
                    limit_value = $4,
                    updated_at = NOW()
                WHERE user_id = $1 AND date = $2
                "#,
            )
            .bind(user_id)
            .bind(date)
            .bind(granted)
            .bind(limit)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(granted)
    }

    async fn release(&self, user_id: UserId, date: NaiveDate, count: i32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE quota_counters SET
                used = GREATEST(used - $3, 0),
                updated_at = NOW()
            WHERE user_id = $1 AND date = $2
            "#,
        )
        .bind(user_id)
        .bind(date)
        .bind(count)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn purge_before(&self, before: NaiveDate) -> Result<u64> {
        let result = sqlx::query("DELETE FROM quota_counters WHERE date < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
