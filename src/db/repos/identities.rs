use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    db::error::DbResult,
    models::{CreateUserIdentity, UpdateUserIdentity, UserIdentity},
};

/// Repository for federated user identities.
///
/// Identities are keyed by `(connection_id, external_id)`, which the schema
/// enforces with a unique constraint.
#[async_trait]
pub trait UserIdentityRepo: Send + Sync {
    /// Look up an identity by its connection and external identifier.
    async fn get_by_external(
        &self,
        connection_id: &str,
        external_id: &str,
    ) -> DbResult<Option<UserIdentity>>;

    /// Create an identity.
    ///
    /// # Errors
    /// Returns `DbError::Conflict` if an identity with the same
    /// `(connection_id, external_id)` already exists.
    async fn create(&self, input: CreateUserIdentity) -> DbResult<UserIdentity>;

    /// Refresh the mutable fields of an identity and stamp `last_login_at`.
    ///
    /// # Errors
    /// Returns `DbError::NotFound` if no identity has this ID.
    async fn update(&self, id: Uuid, input: UpdateUserIdentity) -> DbResult<UserIdentity>;

    /// Count identities federated through a connection.
    async fn count_by_connection(&self, connection_id: &str) -> DbResult<i64>;
}
