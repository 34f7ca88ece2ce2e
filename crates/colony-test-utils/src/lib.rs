//! Shared test utilities for colony integration tests.
//!
//! Each test gets its own sqlite database file in a temporary directory,
//! with all migrations applied. Keep the returned [`TestDb`] alive for the
//! duration of the test; dropping it deletes the directory.

use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use colony_db::config::DbConfig;
use colony_db::pool;

/// A temporary database plus the directory that holds it.
pub struct TestDb {
    pub pool: SqlitePool,
    /// Held to keep the database file alive until the test ends.
    _dir: TempDir,
}

/// Create a temporary database with migrations applied.
pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_file = dir
        .path()
        .join(format!("colony_test_{}.db", Uuid::new_v4().simple()));
    let config = DbConfig::new(format!("sqlite://{}", db_file.display()));

    let pool = pool::create_pool(&config)
        .await
        .expect("failed to open test database");

    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("migrations should succeed");

    TestDb { pool, _dir: dir }
}
