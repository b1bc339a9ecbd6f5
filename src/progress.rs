// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Durable refresh-progress snapshot.
//
// A singleton row (id = 1) mirroring the state of the most recent
// credential refresh run. Partial updates preserve prior values via
// COALESCE; every write bumps `updated_at`.

use crate::db::DbError;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

/// The persisted snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshProgress {
    pub running: bool,
    pub current: i64,
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub updated_at: i64,
}

/// A partial update; `None` fields keep their stored values.
#[derive(Debug, Clone, Default)]
pub struct ProgressPatch {
    pub running: Option<bool>,
    pub current: Option<i64>,
    pub total: Option<i64>,
    pub success: Option<i64>,
    pub failed: Option<i64>,
}

impl ProgressPatch {
    /// The patch written when a refresh run starts.
    pub fn started(total: i64) -> Self {
        Self {
            running: Some(true),
            current: Some(0),
            total: Some(total),
            success: Some(0),
            failed: Some(0),
        }
    }
}

pub struct RefreshProgressStore {
    pool: SqlitePool,
}

impl RefreshProgressStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current snapshot; all zeros when no refresh ever ran.
    pub async fn read(&self) -> Result<RefreshProgress, DbError> {
        let row = sqlx::query(
            "SELECT running, current, total, success, failed, updated_at \
             FROM token_refresh_progress WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => RefreshProgress {
                running: row.get::<i64, _>("running") != 0,
                current: row.get("current"),
                total: row.get("total"),
                success: row.get("success"),
                failed: row.get("failed"),
                updated_at: row.get("updated_at"),
            },
            None => RefreshProgress::default(),
        })
    }

    /// Apply a partial update. Absent fields keep their prior values;
    /// `updated_at` is always bumped.
    pub async fn update(&self, patch: &ProgressPatch) -> Result<(), DbError> {
        let updated_at = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO token_refresh_progress \
             (id, running, current, total, success, failed, updated_at) \
             VALUES (1, COALESCE(?1, 0), COALESCE(?2, 0), COALESCE(?3, 0), \
                     COALESCE(?4, 0), COALESCE(?5, 0), ?6) \
             ON CONFLICT(id) DO UPDATE SET \
                 running = COALESCE(?1, running), \
                 current = COALESCE(?2, current), \
                 total = COALESCE(?3, total), \
                 success = COALESCE(?4, success), \
                 failed = COALESCE(?5, failed), \
                 updated_at = ?6",
        )
        .bind(patch.running.map(i64::from))
        .bind(patch.current)
        .bind(patch.total)
        .bind(patch.success)
        .bind(patch.failed)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
