//! SAML login orchestration.
//!
//! A login is two HTTP requests with the IdP in between. [`SamlFlow::initiate`]
//! builds the AuthnRequest and the signed RelayState; [`SamlFlow::complete_login`]
//! receives the IdP's response. No flow state is stored between the two: the
//! RelayState carries it, and it alone selects the connection whose
//! certificates, audience and ACS URL the response is validated against.

use std::sync::Arc;

use chrono::{Duration, Utc};
use url::Url;

use super::{
    assertion::{self, AssertionError, ValidationContext},
    authn_request::{self, AuthnRequestError},
    identity::{IdentityResolver, ResolveError},
    relay_state::{RelayState, RelayStateCodec, StateError},
    token::{IssuedToken, TokenError, TokenIssuer},
};
use crate::{
    config::BrokerConfig,
    db::{DbError, DbPool},
    models::{SamlConnection, UserIdentity},
};

const MAX_RETURN_URL_LEN: usize = 2048;

/// Where a login stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Initiated,
    AwaitingIdpResponse,
    ResponseReceived,
    Validated,
    IdentityResolved,
    TokenIssued,
    Redirected,
    /// Terminal failure, carrying the error kind.
    Failed(&'static str),
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Redirected | Self::Failed(_))
    }

    /// Forward-only transitions; any non-terminal state may fail.
    pub fn can_transition_to(&self, next: &FlowState) -> bool {
        use FlowState::*;
        match (self, next) {
            (s, Failed(_)) => !s.is_terminal(),
            (Initiated, AwaitingIdpResponse)
            | (AwaitingIdpResponse, ResponseReceived)
            | (ResponseReceived, Validated)
            | (Validated, IdentityResolved)
            | (IdentityResolved, TokenIssued)
            | (TokenIssued, Redirected) => true,
            _ => false,
        }
    }
}

struct FlowTracker {
    state: FlowState,
}

impl FlowTracker {
    fn new(state: FlowState) -> Self {
        Self { state }
    }

    fn advance(&mut self, next: FlowState) {
        debug_assert!(
            self.state.can_transition_to(&next),
            "invalid flow transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(from = ?self.state, to = ?next, "SAML flow transition");
        self.state = next;
    }

    fn fail(mut self, error: FlowError) -> FlowFailure {
        self.advance(FlowState::Failed(error.kind()));
        FlowFailure {
            state: self.state,
            error,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Assertion(#[from] AssertionError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    AuthnRequest(#[from] AuthnRequestError),

    #[error("unknown or disabled connection '{0}'")]
    UnknownConnection(String),

    #[error("invalid return URL: {0}")]
    InvalidReturnUrl(String),

    #[error("database error: {0}")]
    Database(#[from] DbError),
}

impl FlowError {
    /// Taxonomy name logged for operators.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::State(e) => e.kind(),
            Self::Assertion(e) => e.kind(),
            Self::Resolve(e) => e.kind(),
            Self::Token(e) => e.kind(),
            Self::AuthnRequest(_) => "AuthnRequestFailed",
            Self::UnknownConnection(_) => "UnknownConnection",
            Self::InvalidReturnUrl(_) => "InvalidReturnUrl",
            Self::Database(_) => "Database",
        }
    }

    /// Failures caused by this service rather than by the request.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            Self::State(StateError::NoSigningKey)
                | Self::Token(TokenError::TokenIssuanceFailed(_))
                | Self::Resolve(ResolveError::Database(_))
                | Self::AuthnRequest(_)
                | Self::Database(_)
        )
    }
}

/// A failed login and the state it failed in.
#[derive(Debug, thiserror::Error)]
#[error("SAML login failed ({kind}): {error}", kind = .error.kind())]
pub struct FlowFailure {
    pub state: FlowState,
    pub error: FlowError,
}

#[derive(Debug)]
pub struct InitiatedLogin {
    /// IdP SSO URL carrying `SAMLRequest` and `RelayState`.
    pub redirect_url: String,
    pub request_id: String,
    pub state: FlowState,
}

#[derive(Debug)]
pub struct CompletedLogin {
    /// Return URL with the token attached.
    pub redirect_url: String,
    pub identity: UserIdentity,
    pub token: IssuedToken,
    pub state: FlowState,
}

/// Orchestrates SAML logins.
#[derive(Clone)]
pub struct SamlFlow {
    db: Arc<DbPool>,
    codec: RelayStateCodec,
    resolver: IdentityResolver,
    issuer: Arc<TokenIssuer>,
    public_base: String,
    clock_skew: Duration,
    token_param: String,
}

impl SamlFlow {
    pub fn new(
        config: &BrokerConfig,
        db: Arc<DbPool>,
        issuer: Arc<TokenIssuer>,
    ) -> Result<Self, FlowError> {
        let clock_skew = config.saml.clock_skew();
        Ok(Self {
            codec: RelayStateCodec::from_config(&config.state, clock_skew)?,
            resolver: IdentityResolver::new(db.identities()),
            db,
            issuer,
            public_base: config.server.public_base().to_string(),
            clock_skew,
            token_param: config.token.token_param.clone(),
        })
    }

    /// Start a login: build the AuthnRequest and the signed RelayState.
    pub async fn initiate(
        &self,
        connection_id: &str,
        return_url: &str,
    ) -> Result<InitiatedLogin, FlowFailure> {
        let mut tracker = FlowTracker::new(FlowState::Initiated);

        match self.prepare_login(connection_id, return_url).await {
            Ok((redirect_url, request_id)) => {
                tracker.advance(FlowState::AwaitingIdpResponse);
                Ok(InitiatedLogin {
                    redirect_url,
                    request_id,
                    state: tracker.state,
                })
            }
            Err(error) => Err(tracker.fail(error)),
        }
    }

    async fn prepare_login(
        &self,
        connection_id: &str,
        return_url: &str,
    ) -> Result<(String, String), FlowError> {
        let connection = self.enabled_connection(connection_id).await?;
        validate_return_url(&connection, return_url)?;

        let acs_url = connection.acs_url(&self.public_base);
        let request = authn_request::prepare(&connection, &acs_url)?;
        let request_id = request.id().to_string();

        let state = RelayState::new(&connection.id, &request_id, return_url, Utc::now());
        let relay_state = self.codec.encode(&state)?;
        let redirect_url = request.redirect_url(&relay_state)?;

        tracing::info!(
            connection_id = %connection.id,
            request_id = %request_id,
            "SAML login initiated"
        );
        Ok((redirect_url, request_id))
    }

    /// Finish a login from the IdP's POST.
    ///
    /// `path_connection_id` is only compared against the signed state for
    /// logging; every decision uses the connection the state names.
    pub async fn complete_login(
        &self,
        path_connection_id: &str,
        raw_response: &str,
        raw_relay_state: &str,
    ) -> Result<CompletedLogin, FlowFailure> {
        let mut tracker = FlowTracker::new(FlowState::AwaitingIdpResponse);
        tracker.advance(FlowState::ResponseReceived);

        match self
            .run_completion(&mut tracker, path_connection_id, raw_response, raw_relay_state)
            .await
        {
            Ok((redirect_url, identity, token)) => {
                tracker.advance(FlowState::Redirected);
                Ok(CompletedLogin {
                    redirect_url,
                    identity,
                    token,
                    state: tracker.state,
                })
            }
            Err(error) => Err(tracker.fail(error)),
        }
    }

    async fn run_completion(
        &self,
        tracker: &mut FlowTracker,
        path_connection_id: &str,
        raw_response: &str,
        raw_relay_state: &str,
    ) -> Result<(String, UserIdentity, IssuedToken), FlowError> {
        let state = self.codec.decode(raw_relay_state)?;

        if state.connection_id != path_connection_id {
            tracing::warn!(
                path_connection_id = %path_connection_id,
                connection_id = %state.connection_id,
                "ACS path names a different connection than the RelayState; using the RelayState"
            );
        }

        let connection = self.enabled_connection(&state.connection_id).await?;
        let return_url = validate_return_url(&connection, &state.return_url)?;
        let acs_url = connection.acs_url(&self.public_base);

        let assertion = assertion::validate_response(
            raw_response,
            &connection,
            &ValidationContext {
                acs_url: &acs_url,
                request_id: &state.request_id,
                now: Utc::now(),
                clock_skew: self.clock_skew,
            },
        )?;
        tracker.advance(FlowState::Validated);

        let ledger_expiry = state.created_at + self.codec.ttl() + self.clock_skew;
        let first_use = self
            .db
            .consumed_requests()
            .consume(&state.request_id, &connection.id, ledger_expiry)
            .await?;
        if !first_use {
            tracing::warn!(
                connection_id = %connection.id,
                request_id = %state.request_id,
                "SAML response replayed for an already completed request"
            );
            return Err(AssertionError::RequestIdMismatch.into());
        }

        let identity = self.resolver.resolve(&connection, &assertion).await?;
        tracker.advance(FlowState::IdentityResolved);

        let audience = connection
            .token_audience
            .clone()
            .unwrap_or_else(|| return_url.origin().ascii_serialization());
        let token = self.issuer.issue(&identity, &audience)?;
        tracker.advance(FlowState::TokenIssued);

        let redirect_url = attach_token(return_url, &self.token_param, &token.token);

        tracing::info!(
            connection_id = %connection.id,
            request_id = %state.request_id,
            identity_id = %identity.id,
            "SAML login completed"
        );

        Ok((redirect_url, identity, token))
    }

    /// Delete expired replay-ledger entries.
    pub async fn purge_consumed_requests(&self) -> Result<u64, DbError> {
        self.db.consumed_requests().purge_expired(Utc::now()).await
    }

    pub fn issuer(&self) -> &Arc<TokenIssuer> {
        &self.issuer
    }

    /// The ACS URL and SP metadata for an enabled connection.
    pub async fn sp_metadata(&self, connection_id: &str) -> Result<String, FlowError> {
        let connection = self.enabled_connection(connection_id).await?;
        let acs_url = connection.acs_url(&self.public_base);
        Ok(authn_request::sp_metadata_xml(&connection, &acs_url))
    }

    async fn enabled_connection(&self, connection_id: &str) -> Result<SamlConnection, FlowError> {
        self.db
            .connections()
            .get(connection_id)
            .await?
            .filter(|c| c.enabled)
            .ok_or_else(|| FlowError::UnknownConnection(connection_id.to_string()))
    }
}

/// Accept absolute http(s) URLs without credentials, restricted to the
/// connection's allowed origins when it has any.
fn validate_return_url(connection: &SamlConnection, return_url: &str) -> Result<Url, FlowError> {
    if return_url.len() > MAX_RETURN_URL_LEN {
        return Err(FlowError::InvalidReturnUrl("too long".into()));
    }
    let url = Url::parse(return_url)
        .map_err(|e| FlowError::InvalidReturnUrl(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(FlowError::InvalidReturnUrl(format!(
            "scheme '{}' is not allowed",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(FlowError::InvalidReturnUrl("missing host".into()));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(FlowError::InvalidReturnUrl(
            "credentials are not allowed".into(),
        ));
    }

    if !connection.allowed_return_origins.is_empty() {
        let origin = url.origin().ascii_serialization();
        let allowed = connection
            .allowed_return_origins
            .iter()
            .any(|o| o.trim_end_matches('/') == origin);
        if !allowed {
            return Err(FlowError::InvalidReturnUrl(format!(
                "origin '{origin}' is not allowed for this connection"
            )));
        }
    }

    Ok(url)
}

/// Append the token, replacing any parameter of the same name.
fn attach_token(mut url: Url, param: &str, token: &str) -> String {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(param, token);
    url.to_string()
}
