mod consumed_requests;
mod identities;
mod saml_connections;

pub use consumed_requests::*;
pub use identities::*;
pub use saml_connections::*;
