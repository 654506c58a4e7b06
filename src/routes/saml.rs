//! SAML 2.0 service-provider routes.
//!
//! - `GET /saml/{connection_id}/init` - builds the AuthnRequest and redirects to the IdP
//! - `POST /saml/{connection_id}/acs` - Assertion Consumer Service (HTTP-POST binding)
//! - `GET /saml/{connection_id}/metadata` - SP metadata for configuring the IdP
//!
//! Every ACS failure is answered with the same opaque 401. The failure kind
//! is logged for operators and never returned to the caller.

use axum::{
    Form,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use http::{StatusCode, header};
use serde::Deserialize;

use crate::{
    AppState,
    auth::{AuthError, FlowError, FlowFailure},
};

/// Query parameters for the init endpoint.
#[derive(Debug, Deserialize)]
pub struct InitQuery {
    /// Where the caller is sent, token attached, once the login completes
    #[serde(rename = "returnURL", alias = "return_url", default)]
    pub return_url: Option<String>,
}

/// Form data from the IdP (HTTP-POST binding).
///
/// Missing fields deserialize as empty strings and fail validation like
/// any other malformed input.
#[derive(Deserialize)]
pub struct AcsForm {
    /// Base64-encoded SAML Response
    #[serde(rename = "SAMLResponse", default)]
    pub saml_response: String,
    /// The RelayState issued by the init endpoint
    #[serde(rename = "RelayState", default)]
    pub relay_state: String,
}

/// Start an SP-initiated login.
#[tracing::instrument(name = "saml.init", skip_all, fields(connection_id = %connection_id))]
pub async fn init(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Query(query): Query<InitQuery>,
) -> Result<Response, AuthError> {
    let return_url = query
        .return_url
        .filter(|url| !url.is_empty())
        .ok_or(AuthError::MissingParameter("returnURL"))?;

    match state.flow.initiate(&connection_id, &return_url).await {
        Ok(login) => Ok(found(&login.redirect_url)),
        Err(FlowFailure { state, error }) => {
            tracing::debug!(failed_in = ?state, "SAML login not started");
            log_flow_error(&connection_id, &error, "SAML login could not be initiated");
            Err(AuthError::from_initiate(&error))
        }
    }
}

/// Assertion Consumer Service: validate the IdP's response and hand the
/// caller a token on the return URL.
#[tracing::instrument(name = "saml.acs", skip_all, fields(connection_id = %connection_id))]
pub async fn acs(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
    Form(form): Form<AcsForm>,
) -> Result<Response, AuthError> {
    match state
        .flow
        .complete_login(&connection_id, &form.saml_response, &form.relay_state)
        .await
    {
        Ok(login) => {
            tracing::debug!(
                identity_id = %login.identity.id,
                expires_in = login.token.expires_in,
                "Redirecting to return URL"
            );
            Ok(found(&login.redirect_url))
        }
        Err(FlowFailure { state, error }) => {
            tracing::debug!(failed_in = ?state, "SAML login aborted");
            log_flow_error(&connection_id, &error, "SAML login failed");
            Err(AuthError::AuthenticationFailed)
        }
    }
}

/// SP metadata for a connection, for import into the IdP.
#[tracing::instrument(name = "saml.metadata", skip_all, fields(connection_id = %connection_id))]
pub async fn metadata(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> Result<Response, AuthError> {
    let metadata = state
        .flow
        .sp_metadata(&connection_id)
        .await
        .map_err(|error| {
            log_flow_error(&connection_id, &error, "SP metadata unavailable");
            AuthError::from_initiate(&error)
        })?;

    Ok((
        [(header::CONTENT_TYPE, "application/samlmetadata+xml")],
        metadata,
    )
        .into_response())
}

/// A 302 redirect. axum's `Redirect` only offers 303, 307 and 308.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn log_flow_error(connection_id: &str, error: &FlowError, message: &str) {
    if error.is_operational() {
        tracing::error!(
            connection_id = %connection_id,
            kind = error.kind(),
            error = %error,
            "{message}"
        );
    } else {
        tracing::warn!(
            connection_id = %connection_id,
            kind = error.kind(),
            error = %error,
            "{message}"
        );
    }
}
