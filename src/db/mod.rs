mod error;
#[cfg(feature = "database-postgres")]
pub mod postgres;
pub mod repos;
#[cfg(feature = "database-sqlite")]
pub mod sqlite;

#[cfg(all(test, any(feature = "database-sqlite", feature = "database-postgres")))]
pub mod tests;

use std::sync::Arc;

pub use error::{DbError, DbResult};
pub use repos::*;

use crate::config::DatabaseConfig;

/// PostgreSQL pool configuration with optional read replica.
#[cfg(feature = "database-postgres")]
pub struct PgPoolPair {
    /// Primary pool for writes.
    pub write: sqlx::PgPool,
    /// Optional read replica pool. If None, reads use the write pool.
    pub read: Option<sqlx::PgPool>,
}

/// Cached repository trait objects, created once at startup.
struct CachedRepos {
    connections: Arc<dyn SamlConnectionRepo>,
    identities: Arc<dyn UserIdentityRepo>,
    consumed_requests: Arc<dyn ConsumedRequestRepo>,
}

#[cfg(feature = "database-sqlite")]
impl CachedRepos {
    fn sqlite(pool: &sqlx::SqlitePool) -> Self {
        Self {
            connections: Arc::new(sqlite::SqliteSamlConnectionRepo::new(pool.clone())),
            identities: Arc::new(sqlite::SqliteUserIdentityRepo::new(pool.clone())),
            consumed_requests: Arc::new(sqlite::SqliteConsumedRequestRepo::new(pool.clone())),
        }
    }
}

#[cfg(feature = "database-postgres")]
impl CachedRepos {
    fn postgres(write_pool: &sqlx::PgPool, read_pool: &Option<sqlx::PgPool>) -> Self {
        Self {
            connections: Arc::new(postgres::PostgresSamlConnectionRepo::new(
                write_pool.clone(),
                read_pool.clone(),
            )),
            identities: Arc::new(postgres::PostgresUserIdentityRepo::new(
                write_pool.clone(),
                read_pool.clone(),
            )),
            consumed_requests: Arc::new(postgres::PostgresConsumedRequestRepo::new(
                write_pool.clone(),
            )),
        }
    }
}

enum PoolStorage {
    #[cfg(feature = "database-sqlite")]
    Sqlite(sqlx::SqlitePool),
    #[cfg(feature = "database-postgres")]
    Postgres(PgPoolPair),
    #[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
    _None(std::convert::Infallible),
}

/// Database pool supporting both SQLite and PostgreSQL.
///
/// Repositories are cached at construction time to avoid allocation on each access.
pub struct DbPool {
    inner: PoolStorage,
    repos: CachedRepos,
}

impl DbPool {
    /// Create a DbPool from an existing SQLite pool.
    /// Primarily useful for testing.
    #[cfg(feature = "database-sqlite")]
    pub fn from_sqlite(pool: sqlx::SqlitePool) -> Self {
        DbPool {
            repos: CachedRepos::sqlite(&pool),
            inner: PoolStorage::Sqlite(pool),
        }
    }

    /// Create a DbPool from existing PostgreSQL pools.
    /// Primarily useful for testing.
    #[cfg(feature = "database-postgres")]
    pub fn from_postgres(write_pool: sqlx::PgPool, read_pool: Option<sqlx::PgPool>) -> Self {
        DbPool {
            repos: CachedRepos::postgres(&write_pool, &read_pool),
            inner: PoolStorage::Postgres(PgPoolPair {
                write: write_pool,
                read: read_pool,
            }),
        }
    }

    /// Create a database pool from configuration
    pub async fn from_config(config: &DatabaseConfig) -> DbResult<Self> {
        match config {
            DatabaseConfig::None => Err(DbError::NotConfigured),
            #[cfg(feature = "database-sqlite")]
            DatabaseConfig::Sqlite(cfg) => {
                // `sqlite:` URLs carry query options such as `mode=memory&cache=shared`.
                let options = if cfg.path.starts_with("sqlite:") {
                    use std::str::FromStr;
                    sqlx::sqlite::SqliteConnectOptions::from_str(&cfg.path)?
                } else {
                    sqlx::sqlite::SqliteConnectOptions::new().filename(&cfg.path)
                };

                let pool = sqlx::sqlite::SqlitePoolOptions::new()
                    .max_connections(cfg.max_connections)
                    .connect_with(
                        options
                            .create_if_missing(cfg.create_if_missing)
                            .journal_mode(if cfg.wal_mode {
                                sqlx::sqlite::SqliteJournalMode::Wal
                            } else {
                                sqlx::sqlite::SqliteJournalMode::Delete
                            })
                            .busy_timeout(std::time::Duration::from_millis(cfg.busy_timeout_ms)),
                    )
                    .await?;

                Ok(Self::from_sqlite(pool))
            }
            #[cfg(feature = "database-postgres")]
            DatabaseConfig::Postgres(cfg) => {
                let pool_options = || {
                    sqlx::postgres::PgPoolOptions::new()
                        .min_connections(cfg.min_connections)
                        .max_connections(cfg.max_connections)
                        .acquire_timeout(std::time::Duration::from_secs(cfg.connect_timeout_secs))
                        .idle_timeout(std::time::Duration::from_secs(cfg.idle_timeout_secs))
                };

                let write_pool = pool_options().connect(&cfg.url).await?;

                let read_pool = if let Some(read_url) = &cfg.read_url {
                    tracing::info!("Configuring read replica pool");
                    Some(pool_options().connect(read_url).await?)
                } else {
                    None
                };

                Ok(Self::from_postgres(write_pool, read_pool))
            }
        }
    }

    /// Run database migrations using sqlx's migration runner
    /// This automatically creates and manages a _sqlx_migrations table
    /// Migrations always run on the primary (write) pool.
    pub async fn run_migrations(&self) -> DbResult<()> {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool) => {
                tracing::info!("Running SQLite migrations");
                sqlx::migrate!("./migrations_sqlx/sqlite").run(pool).await?;
                tracing::info!("SQLite migrations completed successfully");
                Ok(())
            }
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pools) => {
                tracing::info!("Running PostgreSQL migrations");
                sqlx::migrate!("./migrations_sqlx/postgres")
                    .run(&pools.write)
                    .await?;
                tracing::info!("PostgreSQL migrations completed successfully");
                Ok(())
            }
            #[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
            PoolStorage::_None(infallible) => match *infallible {},
        }
    }

    /// Get SAML connection repository
    pub fn connections(&self) -> Arc<dyn SamlConnectionRepo> {
        Arc::clone(&self.repos.connections)
    }

    /// Get user identity repository
    pub fn identities(&self) -> Arc<dyn UserIdentityRepo> {
        Arc::clone(&self.repos.identities)
    }

    /// Get consumed-request ledger
    pub fn consumed_requests(&self) -> Arc<dyn ConsumedRequestRepo> {
        Arc::clone(&self.repos.consumed_requests)
    }

    /// Health check for database connectivity
    pub async fn health_check(&self) -> DbResult<()> {
        match &self.inner {
            #[cfg(feature = "database-sqlite")]
            PoolStorage::Sqlite(pool) => {
                sqlx::query("SELECT 1").execute(pool).await?;
                Ok(())
            }
            #[cfg(feature = "database-postgres")]
            PoolStorage::Postgres(pools) => {
                // Check both write and read pools
                sqlx::query("SELECT 1").execute(&pools.write).await?;
                if let Some(read) = &pools.read {
                    sqlx::query("SELECT 1").execute(read).await?;
                }
                Ok(())
            }
            #[cfg(not(any(feature = "database-sqlite", feature = "database-postgres")))]
            PoolStorage::_None(infallible) => match *infallible {},
        }
    }
}
