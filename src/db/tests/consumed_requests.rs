//! Shared tests for ConsumedRequestRepo implementations

use chrono::{Duration, Utc};

use crate::db::repos::ConsumedRequestRepo;

pub async fn test_consume_once(repo: &dyn ConsumedRequestRepo) {
    let expires_at = Utc::now() + Duration::minutes(10);

    let first = repo
        .consume("_req-1", "conn-1", expires_at)
        .await
        .expect("Failed to consume request");
    assert!(first);

    let second = repo
        .consume("_req-1", "conn-1", expires_at)
        .await
        .expect("Replay check should succeed");
    assert!(!second);
}

pub async fn test_distinct_requests_independent(repo: &dyn ConsumedRequestRepo) {
    let expires_at = Utc::now() + Duration::minutes(10);

    assert!(repo.consume("_req-1", "conn-1", expires_at).await.unwrap());
    assert!(repo.consume("_req-2", "conn-1", expires_at).await.unwrap());
}

pub async fn test_purge_expired(repo: &dyn ConsumedRequestRepo) {
    let now = Utc::now();

    repo.consume("_old", "conn-1", now - Duration::minutes(1))
        .await
        .unwrap();
    repo.consume("_fresh", "conn-1", now + Duration::minutes(10))
        .await
        .unwrap();

    let purged = repo.purge_expired(now).await.expect("Purge should succeed");
    assert_eq!(purged, 1);

    // The fresh entry still blocks replays
    assert!(!repo
        .consume("_fresh", "conn-1", now + Duration::minutes(10))
        .await
        .unwrap());
}

// ============================================================================
// SQLite Tests
// ============================================================================

#[cfg(all(test, feature = "database-sqlite"))]
mod sqlite_tests {
    use crate::db::{
        sqlite::SqliteConsumedRequestRepo,
        tests::harness::{create_sqlite_pool, run_sqlite_migrations},
    };

    async fn create_repo() -> SqliteConsumedRequestRepo {
        let pool = create_sqlite_pool().await;
        run_sqlite_migrations(&pool).await;
        SqliteConsumedRequestRepo::new(pool)
    }

    macro_rules! sqlite_test {
        ($name:ident) => {
            #[tokio::test]
            async fn $name() {
                let repo = create_repo().await;
                super::$name(&repo).await;
            }
        };
    }

    sqlite_test!(test_consume_once);
    sqlite_test!(test_distinct_requests_independent);
    sqlite_test!(test_purge_expired);
}

// ============================================================================
// PostgreSQL Tests - Require Docker, run with `cargo test -- --ignored`
// ============================================================================

#[cfg(all(test, feature = "database-postgres"))]
mod postgres_tests {
    use crate::db::{
        postgres::PostgresConsumedRequestRepo,
        tests::harness::postgres::{create_isolated_postgres_pool, run_postgres_migrations},
    };

    macro_rules! postgres_test {
        ($name:ident) => {
            #[tokio::test]
            #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
            async fn $name() {
                let pool = create_isolated_postgres_pool().await;
                run_postgres_migrations(&pool).await;
                let repo = PostgresConsumedRequestRepo::new(pool);
                super::$name(&repo).await;
            }
        };
    }

    postgres_test!(test_consume_once);
    postgres_test!(test_distinct_requests_independent);
    postgres_test!(test_purge_expired);
}
