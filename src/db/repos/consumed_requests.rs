use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::error::DbResult;

/// Ledger of AuthnRequest IDs that have already completed a login.
///
/// A RelayState is signed but stateless, so without this ledger the same
/// state and SAML response could be posted twice within the state window.
#[async_trait]
pub trait ConsumedRequestRepo: Send + Sync {
    /// Record a request ID as consumed.
    ///
    /// Returns `true` if this call consumed it and `false` if it had already
    /// been consumed. Entries are kept until `expires_at`.
    async fn consume(
        &self,
        request_id: &str,
        connection_id: &str,
        expires_at: DateTime<Utc>,
    ) -> DbResult<bool>;

    /// Delete entries whose `expires_at` is before `now`. Returns the number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> DbResult<u64>;
}
