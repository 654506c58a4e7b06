use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::common::parse_json;
use crate::{
    db::{
        error::{DbError, DbResult},
        repos::SamlConnectionRepo,
    },
    models::{CreateSamlConnection, SamlConnection},
};

const COLUMNS: &str = "id, organization_id, version, idp_entity_id, idp_sso_url, \
    idp_certificates, sp_entity_id, acs_url, attribute_mapping, require_signed_assertions, \
    name_id_format, force_authn, token_audience, allowed_return_origins, enabled, \
    created_at, updated_at";

pub struct SqliteSamlConnectionRepo {
    pool: SqlitePool,
}

impl SqliteSamlConnectionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn parse_connection(row: &sqlx::sqlite::SqliteRow) -> DbResult<SamlConnection> {
        Ok(SamlConnection {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            version: row.get("version"),
            idp_entity_id: row.get("idp_entity_id"),
            idp_sso_url: row.get("idp_sso_url"),
            idp_certificates: parse_json(&row.get::<String, _>("idp_certificates"))?,
            sp_entity_id: row.get("sp_entity_id"),
            acs_url: row.get("acs_url"),
            attribute_mapping: parse_json(&row.get::<String, _>("attribute_mapping"))?,
            require_signed_assertions: row.get::<i32, _>("require_signed_assertions") != 0,
            name_id_format: row.get("name_id_format"),
            force_authn: row.get::<i32, _>("force_authn") != 0,
            token_audience: row.get("token_audience"),
            allowed_return_origins: parse_json(&row.get::<String, _>("allowed_return_origins"))?,
            enabled: row.get::<i32, _>("enabled") != 0,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl SamlConnectionRepo for SqliteSamlConnectionRepo {
    async fn get(&self, id: &str) -> DbResult<Option<SamlConnection>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM saml_connections WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::parse_connection).transpose()
    }

    async fn list(&self) -> DbResult<Vec<SamlConnection>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM saml_connections ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::parse_connection).collect()
    }

    async fn upsert(&self, input: CreateSamlConnection) -> DbResult<SamlConnection> {
        let now = chrono::Utc::now();

        sqlx::query(
            r#"
            INSERT INTO saml_connections (
                id, organization_id, version, idp_entity_id, idp_sso_url,
                idp_certificates, sp_entity_id, acs_url, attribute_mapping,
                require_signed_assertions, name_id_format, force_authn, token_audience,
                allowed_return_origins, enabled, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                organization_id = excluded.organization_id,
                version = excluded.version,
                idp_entity_id = excluded.idp_entity_id,
                idp_sso_url = excluded.idp_sso_url,
                idp_certificates = excluded.idp_certificates,
                sp_entity_id = excluded.sp_entity_id,
                acs_url = excluded.acs_url,
                attribute_mapping = excluded.attribute_mapping,
                require_signed_assertions = excluded.require_signed_assertions,
                name_id_format = excluded.name_id_format,
                force_authn = excluded.force_authn,
                token_audience = excluded.token_audience,
                allowed_return_origins = excluded.allowed_return_origins,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&input.id)
        .bind(&input.organization_id)
        .bind(input.version)
        .bind(&input.idp_entity_id)
        .bind(&input.idp_sso_url)
        .bind(serde_json::to_string(&input.idp_certificates)?)
        .bind(&input.sp_entity_id)
        .bind(&input.acs_url)
        .bind(serde_json::to_string(&input.attribute_mapping)?)
        .bind(input.require_signed_assertions as i32)
        .bind(&input.name_id_format)
        .bind(input.force_authn as i32)
        .bind(&input.token_audience)
        .bind(serde_json::to_string(&input.allowed_return_origins)?)
        .bind(input.enabled as i32)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get(&input.id)
            .await?
            .ok_or_else(|| DbError::Internal(format!("connection '{}' vanished after upsert", input.id)))
    }
}
