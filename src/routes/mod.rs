pub mod health;
pub mod jwks;
pub mod saml;
