// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Database pool construction and schema.
//
// SQLite via sqlx. The schema is created idempotently at startup;
// there is no migration framework.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Open (creating if needed) the database at `path` and ensure the
/// schema exists.
pub async fn connect(path: &str) -> Result<SqlitePool, DbError> {
    let url = format!("sqlite://{path}?mode=rwc");
    let pool = SqlitePoolOptions::new().connect(&url).await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests. Pinned to one connection so every
/// query sees the same memory store.
pub async fn connect_memory() -> Result<SqlitePool, DbError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    ensure_schema(&pool).await?;
    Ok(pool)
}

async fn ensure_schema(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS token_refresh_progress (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            running INTEGER NOT NULL DEFAULT 0,
            current INTEGER NOT NULL DEFAULT 0,
            total INTEGER NOT NULL DEFAULT 0,
            success INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            time TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            ip TEXT NOT NULL,
            model TEXT NOT NULL,
            duration REAL NOT NULL,
            status INTEGER NOT NULL,
            key_name TEXT NOT NULL,
            token_suffix TEXT NOT NULL,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp ON request_logs (timestamp)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
