use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::common::{parse_json, parse_uuid};
use crate::{
    db::{
        error::{DbError, DbResult},
        repos::UserIdentityRepo,
    },
    models::{CreateUserIdentity, UpdateUserIdentity, UserIdentity},
};

pub struct SqliteUserIdentityRepo {
    pool: SqlitePool,
}

impl SqliteUserIdentityRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_identity(row: &sqlx::sqlite::SqliteRow) -> DbResult<UserIdentity> {
        Ok(UserIdentity {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            organization_id: row.get("organization_id"),
            connection_id: row.get("connection_id"),
            external_id: row.get("external_id"),
            email: row.get("email"),
            attributes: parse_json(&row.get::<String, _>("attributes"))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            last_login_at: row.get("last_login_at"),
        })
    }
}

#[async_trait]
impl UserIdentityRepo for SqliteUserIdentityRepo {
    async fn get_by_external(
        &self,
        connection_id: &str,
        external_id: &str,
    ) -> DbResult<Option<UserIdentity>> {
        let row = sqlx::query(
            r#"
            SELECT id, organization_id, connection_id, external_id, email, attributes,
                   created_at, updated_at, last_login_at
            FROM saml_identities
            WHERE connection_id = ? AND external_id = ?
            "#,
        )
        .bind(connection_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_identity).transpose()
    }

    async fn create(&self, input: CreateUserIdentity) -> DbResult<UserIdentity> {
        let id = Uuid::new_v4();
        let now = chrono::Utc::now();

        sqlx::query(
            r#"
            INSERT INTO saml_identities (
                id, organization_id, connection_id, external_id, email, attributes,
                created_at, updated_at, last_login_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&input.organization_id)
        .bind(&input.connection_id)
        .bind(&input.external_id)
        .bind(&input.email)
        .bind(serde_json::to_string(&input.attributes)?)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => DbError::Conflict(
                format!(
                    "Identity '{}' already exists for connection '{}'",
                    input.external_id, input.connection_id
                ),
            ),
            _ => DbError::from(e),
        })?;

        Ok(UserIdentity {
            id,
            organization_id: input.organization_id,
            connection_id: input.connection_id,
            external_id: input.external_id,
            email: input.email,
            attributes: input.attributes,
            created_at: now,
            updated_at: now,
            last_login_at: now,
        })
    }

    async fn update(&self, id: Uuid, input: UpdateUserIdentity) -> DbResult<UserIdentity> {
        let now = chrono::Utc::now();

        let row = sqlx::query(
            r#"
            UPDATE saml_identities
            SET email = ?, attributes = ?, updated_at = ?, last_login_at = ?
            WHERE id = ?
            RETURNING id, organization_id, connection_id, external_id, email, attributes,
                      created_at, updated_at, last_login_at
            "#,
        )
        .bind(&input.email)
        .bind(serde_json::to_string(&input.attributes)?)
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(DbError::NotFound)?;

        Self::parse_identity(&row)
    }

    async fn count_by_connection(&self, connection_id: &str) -> DbResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM saml_identities WHERE connection_id = ?")
            .bind(connection_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get::<i64, _>("count"))
    }
}
