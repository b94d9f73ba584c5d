//! SQLite-backed per-channel language preference store.

use polyglot_core::{config::StorageConfig, error::PolyglotError, shellexpand};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// Persistent preference store backed by SQLite.
///
/// Read-only from the dispatch core's perspective; only the command handler
/// writes to it.
#[derive(Clone)]
pub struct PrefStore {
    pool: SqlitePool,
}

impl PrefStore {
    /// Create a new store, running migrations on first use.
    pub async fn new(config: &StorageConfig) -> Result<Self, PolyglotError> {
        let db_path = shellexpand(&config.db_path);

        // Ensure parent directory exists.
        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PolyglotError::Storage(format!("failed to create data dir: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
            .map_err(|e| PolyglotError::Storage(format!("invalid db path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| PolyglotError::Storage(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;

        info!("Preference store initialized at {db_path}");

        Ok(Self { pool })
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self, PolyglotError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| PolyglotError::Storage(format!("invalid db options: {e}")))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| PolyglotError::Storage(format!("failed to open sqlite: {e}")))?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Run SQL migrations, tracking which have already been applied.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), PolyglotError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| PolyglotError::Storage(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] = &[("001_init", include_str!("../migrations/001_init.sql"))];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| {
                        PolyglotError::Storage(format!("failed to check migration {name}: {e}"))
                    })?;
            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| PolyglotError::Storage(format!("migration {name} failed: {e}")))?;
            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| {
                    PolyglotError::Storage(format!("failed to record migration {name}: {e}"))
                })?;
        }

        Ok(())
    }

    /// Set the target language for a channel.
    pub async fn set_language(
        &self,
        guild_id: &str,
        channel_id: &str,
        language: &str,
    ) -> Result<(), PolyglotError> {
        sqlx::query(
            "INSERT INTO channel_languages (guild_id, channel_id, language) \
             VALUES (?, ?, ?) \
             ON CONFLICT (guild_id, channel_id) \
             DO UPDATE SET language = excluded.language, updated_at = datetime('now')",
        )
        .bind(guild_id)
        .bind(channel_id)
        .bind(language)
        .execute(&self.pool)
        .await
        .map_err(|e| PolyglotError::Storage(format!("failed to set language: {e}")))?;
        Ok(())
    }

    /// The target language configured for a channel, if any.
    pub async fn language_for(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Option<String>, PolyglotError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT language FROM channel_languages WHERE guild_id = ? AND channel_id = ?",
        )
        .bind(guild_id)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PolyglotError::Storage(format!("failed to read language: {e}")))?;
        Ok(row.map(|(language,)| language))
    }

    /// Remove the target language for a channel. Returns whether a row was
    /// deleted.
    pub async fn clear_language(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<bool, PolyglotError> {
        let result =
            sqlx::query("DELETE FROM channel_languages WHERE guild_id = ? AND channel_id = ?")
                .bind(guild_id)
                .bind(channel_id)
                .execute(&self.pool)
                .await
                .map_err(|e| PolyglotError::Storage(format!("failed to clear language: {e}")))?;
        Ok(result.rows_affected() > 0)
    }
}
