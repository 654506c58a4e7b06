use async_trait::async_trait;

use crate::{
    db::error::DbResult,
    models::{CreateSamlConnection, SamlConnection},
};

/// Repository for SAML connections.
///
/// Connections are owned by a separate management service; the broker only
/// reads them at login time. `upsert` exists so connections declared in the
/// config file can be seeded at startup.
#[async_trait]
pub trait SamlConnectionRepo: Send + Sync {
    /// Get a connection by its identifier, enabled or not.
    async fn get(&self, id: &str) -> DbResult<Option<SamlConnection>>;

    /// List all connections ordered by identifier.
    async fn list(&self) -> DbResult<Vec<SamlConnection>>;

    /// Insert a connection, or replace an existing one with the same ID.
    ///
    /// `created_at` is preserved on replace.
    async fn upsert(&self, input: CreateSamlConnection) -> DbResult<SamlConnection>;
}
