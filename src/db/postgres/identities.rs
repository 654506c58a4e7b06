use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    db::{
        error::{DbError, DbResult},
        repos::UserIdentityRepo,
    },
    models::{CreateUserIdentity, UpdateUserIdentity, UserIdentity},
};

pub struct PostgresUserIdentityRepo {
    write_pool: PgPool,
    read_pool: PgPool,
}

impl PostgresUserIdentityRepo {
    pub fn new(write_pool: PgPool, read_pool: Option<PgPool>) -> Self {
        let read_pool = read_pool.unwrap_or_else(|| write_pool.clone());
        Self {
            write_pool,
            read_pool,
        }
    }

    fn parse_identity(row: &sqlx::postgres::PgRow) -> DbResult<UserIdentity> {
        Ok(UserIdentity {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            connection_id: row.get("connection_id"),
            external_id: row.get("external_id"),
            email: row.get("email"),
            attributes: serde_json::from_value(row.get("attributes"))?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            last_login_at: row.get("last_login_at"),
        })
    }
}

#[async_trait]
impl UserIdentityRepo for PostgresUserIdentityRepo {
    async fn get_by_external(
        &self,
        connection_id: &str,
        external_id: &str,
    ) -> DbResult<Option<UserIdentity>> {
        // Reads go to the primary: a replica may lag behind a create that
        // just lost a uniqueness race.
        let row = sqlx::query(
            r#"
            SELECT id, organization_id, connection_id, external_id, email, attributes,
                   created_at, updated_at, last_login_at
            FROM saml_identities
            WHERE connection_id = $1 AND external_id = $2
            "#,
        )
        .bind(connection_id)
        .bind(external_id)
        .fetch_optional(&self.write_pool)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7, $7)
            "#,
        )
        .bind(id)
        .bind(&input.organization_id)
        .bind(&input.connection_id)
        .bind(&input.external_id)
        .bind(&input.email)
        .bind(serde_json::to_value(&input.attributes)?)
        .bind(now)
        .execute(&self.write_pool)
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
            SET email = $1, attributes = $2, updated_at = $3, last_login_at = $3
            WHERE id = $4
            RETURNING id, organization_id, connection_id, external_id, email, attributes,
                      created_at, updated_at, last_login_at
            "#,
        )
        .bind(&input.email)
        .bind(serde_json::to_value(&input.attributes)?)
        .bind(now)
        .bind(id)
        .fetch_optional(&self.write_pool)
        .await?
        .ok_or(DbError::NotFound)?;

        Self::parse_identity(&row)
    }

    async fn count_by_connection(&self, connection_id: &str) -> DbResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM saml_identities WHERE connection_id = $1")
            .bind(connection_id)
            .fetch_one(&self.read_pool)
            .await?;

        Ok(row.get::<i64, _>("count"))
    }
}
