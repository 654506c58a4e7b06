mod consumed_requests;
mod identities;
mod saml_connections;

pub use consumed_requests::PostgresConsumedRequestRepo;
pub use identities::PostgresUserIdentityRepo;
pub use saml_connections::PostgresSamlConnectionRepo;
