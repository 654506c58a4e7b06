use std::sync::Arc;

use crate::{
    auth::assertion::ValidatedAssertion,
    db::{DbError, UserIdentityRepo},
    models::{CreateUserIdentity, SamlConnection, UpdateUserIdentity, UserIdentity},
};

/// Attempts at the lookup-then-write cycle before a uniqueness race is
/// reported as a conflict.
pub const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("identity for '{external_id}' kept conflicting after {attempts} attempts")]
    IdentityConflict { external_id: String, attempts: usize },

    #[error("identity store error: {0}")]
    Database(#[from] DbError),
}

impl ResolveError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IdentityConflict { .. } => "IdentityConflict",
            Self::Database(_) => "Database",
        }
    }
}

/// Maps validated assertions onto persisted identities.
///
/// Identities are keyed by `(connection_id, external_id)`. The store's unique
/// constraint serializes concurrent first logins: the loser of a creation
/// race sees `DbError::Conflict` and retries, finding the winner's record.
#[derive(Clone)]
pub struct IdentityResolver {
    identities: Arc<dyn UserIdentityRepo>,
}

impl IdentityResolver {
    pub fn new(identities: Arc<dyn UserIdentityRepo>) -> Self {
        Self { identities }
    }

    /// Create the identity on first login, or refresh its email and
    /// attributes. `external_id` is never rewritten.
    pub async fn resolve(
        &self,
        connection: &SamlConnection,
        assertion: &ValidatedAssertion,
    ) -> Result<UserIdentity, ResolveError> {
        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            let existing = self
                .identities
                .get_by_external(&connection.id, &assertion.external_id)
                .await?;

            let result = match existing {
                Some(identity) => {
                    self.identities
                        .update(
                            identity.id,
                            UpdateUserIdentity {
                                email: assertion.email.clone(),
                                attributes: assertion.mapped_attributes.clone(),
                            },
                        )
                        .await
                }
                None => {
                    self.identities
                        .create(CreateUserIdentity {
                            organization_id: connection.organization_id.clone(),
                            connection_id: connection.id.clone(),
                            external_id: assertion.external_id.clone(),
                            email: assertion.email.clone(),
                            attributes: assertion.mapped_attributes.clone(),
                        })
                        .await
                }
            };

            match result {
                Ok(identity) => return Ok(identity),
                // Lost a creation race, or the row vanished between read and write
                Err(DbError::Conflict(_) | DbError::NotFound) => {
                    tracing::debug!(
                        connection_id = %connection.id,
                        attempt,
                        "Identity write raced with another login, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ResolveError::IdentityConflict {
            external_id: assertion.external_id.clone(),
            attempts: MAX_RESOLVE_ATTEMPTS,
        })
    }
}
