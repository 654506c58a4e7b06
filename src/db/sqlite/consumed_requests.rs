use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::{error::DbResult, repos::ConsumedRequestRepo};

pub struct SqliteConsumedRequestRepo {
    pool: SqlitePool,
}

impl SqliteConsumedRequestRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConsumedRequestRepo for SqliteConsumedRequestRepo {
    async fn consume(
        &self,
        request_id: &str,
        connection_id: &str,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO consumed_saml_requests (request_id, connection_id, consumed_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(request_id) DO NOTHING
            "#,
        )
        .bind(request_id)
        .bind(connection_id)
        .bind(Utc::now())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM consumed_saml_requests WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
