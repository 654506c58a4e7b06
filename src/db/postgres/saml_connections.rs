use async_trait::async_trait;
use sqlx::{PgPool, Row};

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

pub struct PostgresSamlConnectionRepo {
    write_pool: PgPool,
    read_pool: PgPool,
}

impl PostgresSamlConnectionRepo {
    pub fn new(write_pool: PgPool, read_pool: Option<PgPool>) -> Self {
        let read_pool = read_pool.unwrap_or_else(|| write_pool.clone());
        Self {
            write_pool,
            read_pool,
        }
    }

    fn parse_connection(row: &sqlx::postgres::PgRow) -> DbResult<SamlConnection> {
        Ok(SamlConnection {
            id: row.get("id"),
            organization_id: row.get("organization_id"),
            version: row.get("version"),
            idp_entity_id: row.get("idp_entity_id"),
            idp_sso_url: row.get("idp_sso_url"),
            idp_certificates: serde_json::from_value(row.get("idp_certificates"))?,
            sp_entity_id: row.get("sp_entity_id"),
            acs_url: row.get("acs_url"),
            attribute_mapping: serde_json::from_value(row.get("attribute_mapping"))?,
            require_signed_assertions: row.get("require_signed_assertions"),
            name_id_format: row.get("name_id_format"),
            force_authn: row.get("force_authn"),
            token_audience: row.get("token_audience"),
            allowed_return_origins: serde_json::from_value(row.get("allowed_return_origins"))?,
            enabled: row.get("enabled"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl SamlConnectionRepo for PostgresSamlConnectionRepo {
    async fn get(&self, id: &str) -> DbResult<Option<SamlConnection>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM saml_connections WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.read_pool)
        .await?;

        row.as_ref().map(Self::parse_connection).transpose()
    }

    async fn list(&self) -> DbResult<Vec<SamlConnection>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM saml_connections ORDER BY id"
        ))
        .fetch_all(&self.read_pool)
        .await?;

        rows.iter().map(Self::parse_connection).collect()
    }

    async fn upsert(&self, input: CreateSamlConnection) -> DbResult<SamlConnection> {
        let now = chrono::Utc::now();

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO saml_connections (
                id, organization_id, version, idp_entity_id, idp_sso_url,
                idp_certificates, sp_entity_id, acs_url, attribute_mapping,
                require_signed_assertions, name_id_format, force_authn, token_audience,
                allowed_return_origins, enabled, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $16)
            ON CONFLICT (id) DO UPDATE SET
                organization_id = EXCLUDED.organization_id,
                version = EXCLUDED.version,
                idp_entity_id = EXCLUDED.idp_entity_id,
                idp_sso_url = EXCLUDED.idp_sso_url,
                idp_certificates = EXCLUDED.idp_certificates,
                sp_entity_id = EXCLUDED.sp_entity_id,
                acs_url = EXCLUDED.acs_url,
                attribute_mapping = EXCLUDED.attribute_mapping,
                require_signed_assertions = EXCLUDED.require_signed_assertions,
                name_id_format = EXCLUDED.name_id_format,
                force_authn = EXCLUDED.force_authn,
                token_audience = EXCLUDED.token_audience,
                allowed_return_origins = EXCLUDED.allowed_return_origins,
                enabled = EXCLUDED.enabled,
                updated_at = EXCLUDED.updated_at
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&input.id)
        .bind(&input.organization_id)
        .bind(input.version)
        .bind(&input.idp_entity_id)
        .bind(&input.idp_sso_url)
        .bind(serde_json::to_value(&input.idp_certificates)?)
        .bind(&input.sp_entity_id)
        .bind(&input.acs_url)
        .bind(serde_json::to_value(&input.attribute_mapping)?)
        .bind(input.require_signed_assertions)
        .bind(&input.name_id_format)
        .bind(input.force_authn)
        .bind(&input.token_audience)
        .bind(serde_json::to_value(&input.allowed_return_origins)?)
        .bind(input.enabled)
        .bind(now)
        .fetch_optional(&self.write_pool)
        .await?
        .ok_or_else(|| DbError::Internal(format!("upsert of connection '{}' returned no row", input.id)))?;

        Self::parse_connection(&row)
    }
}
