use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use sso_broker::{
    AppState,
    auth::{SamlFlow, TokenIssuer},
    build_app,
    config::BrokerConfig,
    db::DbPool,
    observability,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

type BoxError = Box<dyn std::error::Error>;

/// CLI arguments for the SSO broker
#[derive(Parser, Debug)]
#[command(version, about = "SAML single-sign-on broker", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file
    #[arg(short, long, global = true, default_value = "sso-broker.toml")]
    config: String,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the HTTP server (default)
    Serve,
    /// Run database migrations and exit
    Migrate,
    /// Print the JSON Web Key Set for the configured token keys
    Jwks,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match BrokerConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_server(config).await,
        Command::Migrate => run_migrations(config).await,
        Command::Jwks => print_jwks(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Exiting with error");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: BrokerConfig) -> Result<(), BoxError> {
    observability::init_tracing(&config.observability)?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let purge_interval =
        Duration::from_secs(config.saml.consumed_request_purge_interval_secs);

    let state = AppState::new(config).await?;
    let task_tracker = state.task_tracker.clone();
    let cancel = CancellationToken::new();

    task_tracker.spawn(purge_consumed_requests(
        state.flow.clone(),
        purge_interval,
        cancel.clone(),
    ));

    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    // Graceful shutdown: wait for SIGINT/SIGTERM, then wait for all background tasks
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(task_tracker, cancel))
        .await?;

    Ok(())
}

async fn run_migrations(config: BrokerConfig) -> Result<(), BoxError> {
    observability::init_tracing(&config.observability)?;

    let db = DbPool::from_config(&config.database).await?;
    db.run_migrations().await?;
    tracing::info!("Migrations complete");
    Ok(())
}

fn print_jwks(config: &BrokerConfig) -> Result<(), BoxError> {
    let issuer = TokenIssuer::from_config(&config.token)?;
    println!("{}", serde_json::to_string_pretty(issuer.jwks())?);
    Ok(())
}

/// Sweep expired replay-ledger rows until cancelled.
async fn purge_consumed_requests(flow: SamlFlow, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match flow.purge_consumed_requests().await {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "Purged expired consumed SAML requests"),
            Err(e) => tracing::warn!(error = %e, "Failed to purge consumed SAML requests"),
        }
    }
}

async fn shutdown_signal(task_tracker: TaskTracker, cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, waiting for background tasks to complete...");

    // Stop background loops, then close the tracker so nothing new is spawned
    cancel.cancel();
    task_tracker.close();

    if tokio::time::timeout(Duration::from_secs(10), task_tracker.wait())
        .await
        .is_err()
    {
        tracing::warn!("Timeout waiting for background tasks to complete");
    } else {
        tracing::info!("All background tasks completed");
    }
}
