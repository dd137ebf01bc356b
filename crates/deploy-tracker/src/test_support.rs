//! Test harness utilities for integration tests.
//!
//! Database-backed suites skip when `DATABASE_URL` is unset so the unit and
//! in-memory workflow tests stay runnable anywhere.

use std::sync::Arc;

use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::storage::MemoryArtifactStore;
use crate::AppState;

pub const TEST_BUCKET: &str = "deployment-tracker-test";

/// Connect to the test database and apply migrations. `None` when
/// `DATABASE_URL` is unset or unreachable, letting callers skip.
pub async fn try_test_pool() -> Option<Pool<Postgres>> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(std::time::Duration::from_secs(8))
        .connect(&url)
        .await
        .ok()?;
    sqlx::migrate!().run(&pool).await.expect("migrations");
    Some(pool)
}

/// Fresh state for an HTTP test: cleaned tables and an in-memory artifact
/// store the test can inspect.
pub async fn try_test_state() -> Option<(AppState, Arc<MemoryArtifactStore>)> {
    let pool = try_test_pool().await?;
    for table in ["deployment_files", "deployments", "services", "users"] {
        let _ = sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&pool)
            .await;
    }
    let store = Arc::new(MemoryArtifactStore::new("http://localhost:9000"));
    let spool_dir = std::env::temp_dir().join("deploy-tracker-test-spool");
    let state = AppState::new(pool, store.clone(), TEST_BUCKET.into(), spool_dir);
    Some((state, store))
}

/// Insert a service row and return its id.
pub async fn insert_service(pool: &Pool<Postgres>, name: &str, application: &str) -> Uuid {
    sqlx::query_scalar("INSERT INTO services (name, application) VALUES ($1, $2) RETURNING id")
        .bind(name)
        .bind(application)
        .fetch_one(pool)
        .await
        .expect("insert service")
}
