use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool};
use std::path::Path;

// Single key-value table; each slot holds one JSON document
const MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL -- Unix Timestamp (seconds)
);
";

/// Durable client-side storage of named JSON documents.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, slot: &str) -> Result<Option<String>>;
    async fn save(&self, slot: &str, value: &str) -> Result<()>;
    async fn remove(&self, slot: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Opens (creating if needed) the database file and runs migrations.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url)
                .await
                .context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database, gone when the store is dropped.
    pub async fn in_memory() -> Result<Self> {
        // every connection to :memory: is a separate database, so pin the pool to one
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        log::info!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        log::info!("Database migrations completed.");
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, slot: &str) -> Result<Option<String>> {
        log::debug!("Loading slot '{}' from database", slot);
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(slot)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load slot from database")?;

        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .context("Failed to read slot value")
    }

    async fn save(&self, slot: &str, value: &str) -> Result<()> {
        log::debug!("Saving slot '{}' ({} bytes)", slot, value.len());
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(slot)
        .bind(value)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to save slot to database")?;
        Ok(())
    }

    async fn remove(&self, slot: &str) -> Result<()> {
        log::warn!("Removing slot '{}' from database", slot);
        let result = sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(slot)
            .execute(&self.pool)
            .await
            .context("Failed to remove slot from database")?;

        if result.rows_affected() == 0 {
            log::debug!("Slot '{}' did not exist", slot);
        }
        Ok(())
    }
}

/// Process-local store, used for ephemeral sessions and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStateStore {
    slots: std::sync::Arc<DashMap<String, String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, slot: &str) -> Result<Option<String>> {
        Ok(self.slots.get(slot).map(|v| v.value().clone()))
    }

    async fn save(&self, slot: &str, value: &str) -> Result<()> {
        self.slots.insert(slot.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, slot: &str) -> Result<()> {
        self.slots.remove(slot);
        Ok(())
    }
}
