//! Shared tests for UserIdentityRepo implementations

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::{
    db::{error::DbError, repos::UserIdentityRepo},
    models::{CreateUserIdentity, UpdateUserIdentity},
};

fn identity_input(connection_id: &str, external_id: &str) -> CreateUserIdentity {
    CreateUserIdentity {
        organization_id: "org-acme".to_string(),
        connection_id: connection_id.to_string(),
        external_id: external_id.to_string(),
        email: format!("{}@example.com", external_id),
        attributes: BTreeMap::from([("department".to_string(), "eng".to_string())]),
    }
}

pub async fn test_create_and_lookup(repo: &dyn UserIdentityRepo) {
    let created = repo
        .create(identity_input("conn-1", "alice"))
        .await
        .expect("Failed to create identity");
    assert_eq!(created.email, "alice@example.com");
    assert_eq!(created.attributes["department"], "eng");

    let found = repo
        .get_by_external("conn-1", "alice")
        .await
        .expect("Lookup should succeed")
        .expect("Identity should exist");
    assert_eq!(found.id, created.id);
    assert_eq!(found.organization_id, "org-acme");
}

pub async fn test_lookup_scoped_by_connection(repo: &dyn UserIdentityRepo) {
    repo.create(identity_input("conn-1", "alice"))
        .await
        .expect("Failed to create identity");

    let other = repo
        .get_by_external("conn-2", "alice")
        .await
        .expect("Lookup should succeed");
    assert!(other.is_none());

    // Same external ID under a different connection is a distinct identity
    repo.create(identity_input("conn-2", "alice"))
        .await
        .expect("Same external ID on another connection should be allowed");
}

pub async fn test_create_duplicate_conflicts(repo: &dyn UserIdentityRepo) {
    repo.create(identity_input("conn-1", "alice"))
        .await
        .expect("Failed to create identity");

    let result = repo.create(identity_input("conn-1", "alice")).await;
    assert!(matches!(result, Err(DbError::Conflict(_))));
    assert_eq!(repo.count_by_connection("conn-1").await.unwrap(), 1);
}

pub async fn test_update_refreshes_mutable_fields(repo: &dyn UserIdentityRepo) {
    let created = repo
        .create(identity_input("conn-1", "alice"))
        .await
        .expect("Failed to create identity");

    let updated = repo
        .update(
            created.id,
            UpdateUserIdentity {
                email: "alice.new@example.com".to_string(),
                attributes: BTreeMap::new(),
            },
        )
        .await
        .expect("Failed to update identity");

    assert_eq!(updated.id, created.id);
    assert_eq!(updated.external_id, "alice");
    assert_eq!(updated.email, "alice.new@example.com");
    assert!(updated.attributes.is_empty());
    assert!(updated.last_login_at >= created.last_login_at);
}

pub async fn test_update_not_found(repo: &dyn UserIdentityRepo) {
    let result = repo
        .update(
            Uuid::new_v4(),
            UpdateUserIdentity {
                email: "nobody@example.com".to_string(),
                attributes: BTreeMap::new(),
            },
        )
        .await;
    assert!(matches!(result, Err(DbError::NotFound)));
}

pub async fn test_count_by_connection(repo: &dyn UserIdentityRepo) {
    assert_eq!(repo.count_by_connection("conn-1").await.unwrap(), 0);
    for user in ["alice", "bob"] {
        repo.create(identity_input("conn-1", user)).await.unwrap();
    }
    repo.create(identity_input("conn-2", "carol")).await.unwrap();

    assert_eq!(repo.count_by_connection("conn-1").await.unwrap(), 2);
    assert_eq!(repo.count_by_connection("conn-2").await.unwrap(), 1);
}

// ============================================================================
// SQLite Tests
// ============================================================================

#[cfg(all(test, feature = "database-sqlite"))]
mod sqlite_tests {
    use crate::db::{
        sqlite::SqliteUserIdentityRepo,
        tests::harness::{create_sqlite_pool, run_sqlite_migrations},
    };

    async fn create_repo() -> SqliteUserIdentityRepo {
        let pool = create_sqlite_pool().await;
        run_sqlite_migrations(&pool).await;
        SqliteUserIdentityRepo::new(pool)
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

    sqlite_test!(test_create_and_lookup);
    sqlite_test!(test_lookup_scoped_by_connection);
    sqlite_test!(test_create_duplicate_conflicts);
    sqlite_test!(test_update_refreshes_mutable_fields);
    sqlite_test!(test_update_not_found);
    sqlite_test!(test_count_by_connection);
}

// ============================================================================
// PostgreSQL Tests - Require Docker, run with `cargo test -- --ignored`
// ============================================================================

#[cfg(all(test, feature = "database-postgres"))]
mod postgres_tests {
    use crate::db::{
        postgres::PostgresUserIdentityRepo,
        tests::harness::postgres::{create_isolated_postgres_pool, run_postgres_migrations},
    };

    macro_rules! postgres_test {
        ($name:ident) => {
            #[tokio::test]
            #[ignore = "Requires Docker - run with `cargo test -- --ignored`"]
            async fn $name() {
                let pool = create_isolated_postgres_pool().await;
                run_postgres_migrations(&pool).await;
                let repo = PostgresUserIdentityRepo::new(pool, None);
                super::$name(&repo).await;
            }
        };
    }

    postgres_test!(test_create_and_lookup);
    postgres_test!(test_lookup_scoped_by_connection);
    postgres_test!(test_create_duplicate_conflicts);
    postgres_test!(test_update_refreshes_mutable_fields);
    postgres_test!(test_update_not_found);
    postgres_test!(test_count_by_connection);
}
