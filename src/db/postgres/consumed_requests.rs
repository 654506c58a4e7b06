use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::{error::DbResult, repos::ConsumedRequestRepo};

pub struct PostgresConsumedRequestRepo {
    write_pool: PgPool,
}

impl PostgresConsumedRequestRepo {
    pub fn new(write_pool: PgPool) -> Self {
        Self { write_pool }
    }
}

#[async_trait]
impl ConsumedRequestRepo for PostgresConsumedRequestRepo {
    async fn consume(
        &self,
        request_id: &str,
        connection_id: &str,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO consumed_saml_requests (request_id, connection_id, consumed_at, expires_at)
            VALUES ($1, $2, NOW(), $3)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(request_id)
        .bind(connection_id)
        .bind(expires_at)
        .execute(&self.write_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM consumed_saml_requests WHERE expires_at < $1")
            .bind(now)
            .execute(&self.write_pool)
            .await?;

        Ok(result.rows_affected())
    }
}
