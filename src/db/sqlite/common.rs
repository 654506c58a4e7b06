use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::db::error::{DbError, DbResult};

/// Parse a UUID string from the database, returning a DbError on failure
pub fn parse_uuid(s: &str) -> DbResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| DbError::Internal(format!("Invalid UUID in database: {}", e)))
}

/// Parse a JSON text column.
pub fn parse_json<T: DeserializeOwned>(s: &str) -> DbResult<T> {
    Ok(serde_json::from_str(s)?)
}
