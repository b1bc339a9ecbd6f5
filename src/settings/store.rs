// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// SQLite-backed settings persistence.
//
// One row per section in the `settings` key/value table. Reads fetch
// all six rows in one query and merge each over section defaults;
// writes upsert all six rows inside one transaction with a shared
// `updated_at` timestamp.

use super::{
    CacheSettings, GlobalSettings, GrokSettings, PerformanceSettings, RegisterSettings,
    SettingsBundle, TokenSettings, SECTION_KEYS,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("settings storage failed: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("settings serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct SettingsStore {
    pool: SqlitePool,
}

impl SettingsStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load all sections, merging stored values over defaults. A
    /// missing or unparsable section falls back to its defaults.
    pub async fn load(&self) -> Result<SettingsBundle, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;

        let mut stored: HashMap<String, String> = HashMap::new();
        for row in rows {
            stored.insert(row.get("key"), row.get("value"));
        }

        let bundle = SettingsBundle {
            global: section::<GlobalSettings>(&stored, "global"),
            grok: section::<GrokSettings>(&stored, "grok"),
            token: section::<TokenSettings>(&stored, "token"),
            cache: section::<CacheSettings>(&stored, "cache"),
            performance: section::<PerformanceSettings>(&stored, "performance"),
            register: section::<RegisterSettings>(&stored, "register"),
        };
        Ok(bundle.normalized())
    }

    /// Persist the whole bundle atomically: six upserts, one
    /// transaction, one timestamp.
    pub async fn save(&self, bundle: &SettingsBundle) -> Result<(), StoreError> {
        let bundle = bundle.clone().normalized();
        let updated_at = chrono::Utc::now().timestamp();

        let blobs: [(&str, String); 6] = [
            ("global", to_json(&bundle.global)?),
            ("grok", to_json(&bundle.grok)?),
            ("token", to_json(&bundle.token)?),
            ("cache", to_json(&bundle.cache)?),
            ("performance", to_json(&bundle.performance)?),
            ("register", to_json(&bundle.register)?),
        ];
        debug_assert_eq!(blobs.len(), SECTION_KEYS.len());

        let mut tx = self.pool.begin().await?;
        for (key, value) in &blobs {
            sqlx::query(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn section<T: DeserializeOwned + Default>(stored: &HashMap<String, String>, key: &str) -> T {
    match stored.get(key) {
        Some(json) => serde_json::from_str(json).unwrap_or_else(|e| {
            tracing::warn!(section = key, error = %e, "unparsable settings section, using defaults");
            T::default()
        }),
        None => T::default(),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}
