use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::config::DatabaseConfig;
use crate::errors::{DbError, DbResult};

// Embed all migration SQL files at compile time
const MIGRATION_REPORT_REQUESTS: &str =
    include_str!("../migrations/20250601000000_report_requests.sql");
const MIGRATION_PARTICIPATION: &str =
    include_str!("../migrations/20250601000001_participation.sql");

// List of migrations with their names and SQL content
const MIGRATIONS: &[(&str, &str)] = &[
    ("20250601000000_report_requests.sql", MIGRATION_REPORT_REQUESTS),
    ("20250601000001_participation.sql", MIGRATION_PARTICIPATION),
];

/// Open a connection pool against the configured database.
pub async fn connect(config: &DatabaseConfig) -> DbResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
        .map_err(|e| DbError::ConnectionPool(e.to_string()))?;
    Ok(pool)
}

/// Apply all pending embedded migrations.
///
/// Applied migration names are tracked in a `_migrations` table so that
/// running this at every startup is idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (name TEXT PRIMARY KEY, applied_at TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;

    for (name, sql) in MIGRATIONS {
        let applied: Option<(String,)> =
            sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                .bind(name)
                .fetch_optional(pool)
                .await?;
        if applied.is_some() {
            continue;
        }

        log::info!("Applying migration {}", name);

        // SQLite executes one statement at a time, so split on the
        // statement separator.
        for statement in sql.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| DbError::Migration(format!("{}: {}", name, e)))?;
        }

        sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(pool)
            .await?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");
    run_migrations(&pool).await.expect("migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = test_pool().await;
        run_migrations(&pool).await.expect("second run");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }

    #[tokio::test]
    async fn test_tables_exist_after_migrations() {
        let pool = test_pool().await;
        for table in ["report_requests", "generated_reports", "participation"] {
            let row: Option<(String,)> = sqlx::query_as(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_optional(&pool)
            .await
            .unwrap();
            assert!(row.is_some(), "missing table {}", table);
        }
    }
}
