//! Observability: structured logging through `tracing`.
//!
//! Log events carry `connection_id`, `request_id`, `identity_id` and the
//! failure `kind` as structured fields. SAML payloads, RelayState values and
//! issued tokens are never logged.

mod tracing_init;

pub use tracing_init::*;
