use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user identity federated through a SAML connection.
///
/// `(connection_id, external_id)` is the stable key. The email and attributes
/// are refreshed on every login; `external_id` is never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: Uuid,
    pub organization_id: String,
    pub connection_id: String,
    pub external_id: String,
    pub email: String,
    pub attributes: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
}

/// Input for creating an identity on first login.
#[derive(Debug, Clone)]
pub struct CreateUserIdentity {
    pub organization_id: String,
    pub connection_id: String,
    pub external_id: String,
    pub email: String,
    pub attributes: BTreeMap<String, String>,
}

/// Mutable fields refreshed on subsequent logins.
#[derive(Debug, Clone)]
pub struct UpdateUserIdentity {
    pub email: String,
    pub attributes: BTreeMap<String, String>,
}
