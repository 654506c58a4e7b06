//! SAML single-sign-on broker.
//!
//! Connects to customer identity providers over SAML 2.0 (SP-initiated,
//! HTTP-Redirect out, HTTP-POST back), validates the signed assertion,
//! resolves it to a durable identity, and hands the caller a short-lived
//! signed identity token on the return URL.

pub mod auth;
pub mod config;
pub mod db;
pub mod models;
pub mod observability;
pub mod routes;

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    routing::{get, post},
};
use http::HeaderName;
use tokio_util::task::TaskTracker;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::{
    auth::{SamlFlow, TokenIssuer},
    config::BrokerConfig,
    db::DbPool,
};

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BrokerConfig>,
    pub db: Arc<DbPool>,
    pub flow: SamlFlow,
    /// Task tracker for background tasks (replay-ledger purge).
    /// Ensures spawned tasks complete during graceful shutdown.
    pub task_tracker: TaskTracker,
}

impl AppState {
    /// Open the configured database and build the state on top of it.
    pub async fn new(config: BrokerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db = DbPool::from_config(&config.database).await?;
        if config.database.run_migrations() {
            db.run_migrations().await?;
        }
        Self::with_db(config, Arc::new(db)).await
    }

    /// Build the state over an already-open database.
    ///
    /// Loads the token signing key and upserts every connection declared in
    /// the config file.
    pub async fn with_db(
        config: BrokerConfig,
        db: Arc<DbPool>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let issuer = Arc::new(TokenIssuer::from_config(&config.token)?);
        tracing::info!(key_id = %issuer.key_id(), "Token signing key loaded");

        let flow = SamlFlow::new(&config, Arc::clone(&db), issuer)?;

        let connections = db.connections();
        for connection in &config.connections {
            connections.upsert(connection.clone()).await?;
            tracing::info!(
                connection_id = %connection.id,
                "SAML connection loaded from config"
            );
        }

        Ok(Self {
            config: Arc::new(config),
            db,
            flow,
            task_tracker: TaskTracker::new(),
        })
    }
}

pub fn build_app(state: AppState) -> Router {
    let server = &state.config.server;
    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/health/live", get(routes::health::liveness))
        .route("/health/ready", get(routes::health::readiness))
        .route("/.well-known/jwks.json", get(routes::jwks::jwks))
        .route("/saml/{connection_id}/init", get(routes::saml::init))
        .route("/saml/{connection_id}/acs", post(routes::saml::acs))
        .route("/saml/{connection_id}/metadata", get(routes::saml::metadata))
        // Layers run bottom-up: the request ID is set before tracing sees the request
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(TimeoutLayer::new(Duration::from_secs(server.timeout_secs)))
        .layer(RequestBodyLimitLayer::new(server.body_limit_bytes))
        .with_state(state)
}
