use std::str::FromStr;
use std::time::Duration;

use frontdesk_core::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

pub type DbPool = sqlx::SqlitePool;

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

pub async fn connect_with_config(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await
}

/// Opens a pool, creating the database file when it does not exist yet.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .connect_with(options)
        .await
}

#[cfg(test)]
mod tests {
    use frontdesk_core::config::DatabaseConfig;
    use sqlx::Row;

    use super::connect_with_config;

    #[tokio::test]
    async fn creates_missing_database_files() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("fresh.db");

        let config = DatabaseConfig {
            url: format!("sqlite://{}", path.display()),
            max_connections: 1,
            timeout_secs: 5,
        };
        let pool = connect_with_config(&config).await.expect("connect");
        let enabled = sqlx::query("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .expect("pragma")
            .get::<i64, _>(0);

        assert_eq!(enabled, 1);
        assert!(path.exists());
        pool.close().await;
    }
}
