pub mod assertion;
pub mod authn_request;
mod error;
pub mod flow;
pub mod identity;
pub mod relay_state;
pub mod token;
pub mod xmldsig;

#[cfg(test)]
pub(crate) mod test_support;

pub use assertion::{AssertionError, ValidatedAssertion, ValidationContext, validate_response};
pub use error::{AuthError, ErrorInfo, ErrorResponse};
pub use flow::{CompletedLogin, FlowError, FlowFailure, FlowState, InitiatedLogin, SamlFlow};
pub use identity::{IdentityResolver, ResolveError};
pub use relay_state::{RelayState, RelayStateCodec, StateError};
pub use token::{IdentityClaims, IssuedToken, TokenError, TokenIssuer, TokenVerifier};
