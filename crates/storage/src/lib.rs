//! Local durable document store: one row per keyed, independently versioned document.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub key: String,
    pub version: i64,
    pub saved_at: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSummary {
    pub key: String,
    pub version: i64,
    pub saved_at: DateTime<Utc>,
    pub size_bytes: i64,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid sqlite url '{database_url}'"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open document store at '{database_url}'"))?;
        let storage = Self { pool };
        storage.ensure_documents_table().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_documents_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                key       TEXT PRIMARY KEY NOT NULL,
                version   INTEGER NOT NULL,
                saved_at  TEXT NOT NULL,
                body      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure documents table exists")?;
        Ok(())
    }

    pub async fn save_document(
        &self,
        key: &str,
        version: i64,
        saved_at: DateTime<Utc>,
        body: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (key, version, saved_at, body) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                version = excluded.version,
                saved_at = excluded.saved_at,
                body = excluded.body",
        )
        .bind(key)
        .bind(version)
        .bind(saved_at)
        .bind(body)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save document '{key}'"))?;
        Ok(())
    }

    pub async fn load_document(&self, key: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT key, version, saved_at, body FROM documents WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load document '{key}'"))?;

        row.map(|row| -> Result<DocumentRecord> {
            Ok(DocumentRecord {
                key: row.try_get("key")?,
                version: row.try_get("version")?,
                saved_at: row.try_get("saved_at")?,
                body: row.try_get("body")?,
            })
        })
        .transpose()
    }

    pub async fn delete_document(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete document '{key}'"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let rows = sqlx::query(
            "SELECT key, version, saved_at, LENGTH(body) AS size_bytes FROM documents ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list documents")?;

        rows.into_iter()
            .map(|row| -> Result<DocumentSummary> {
                Ok(DocumentSummary {
                    key: row.try_get("key")?,
                    version: row.try_get("version")?,
                    saved_at: row.try_get("saved_at")?,
                    size_bytes: row.try_get("size_bytes")?,
                })
            })
            .collect()
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
