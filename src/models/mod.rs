mod identity;
mod saml_connection;
pub mod validators;

pub use identity::*;
pub use saml_connection::*;
