mod common;
mod consumed_requests;
mod identities;
mod saml_connections;

pub use consumed_requests::SqliteConsumedRequestRepo;
pub use identities::SqliteUserIdentityRepo;
pub use saml_connections::SqliteSamlConnectionRepo;
