// Copyright 2026 The Gantry Project
// SPDX-License-Identifier: Apache-2.0

// Request logging and statistics.
//
// Append-only log of completed requests, plus an aggregate query that
// scans the last 14 days once and derives hourly buckets (last 24h)
// and daily buckets (14d) from the same pass.

use crate::db::DbError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

/// One completed request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogEntry {
    /// Human-readable completion time (UTC).
    pub time: String,
    /// Unix seconds, the field all aggregation runs on.
    pub timestamp: i64,
    pub ip: String,
    pub model: String,
    /// Wall-clock duration in seconds.
    pub duration: f64,
    pub status: i64,
    pub key_name: String,
    pub token_suffix: String,
    pub error: Option<String>,
}

impl RequestLogEntry {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            time: now.format("%Y-%m-%d %H:%M:%S").to_string(),
            timestamp: now.timestamp(),
            ip: String::new(),
            model: String::new(),
            duration: 0.0,
            status: 200,
            key_name: String::new(),
            token_suffix: String::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourBucket {
    /// Bucket label, e.g. `2026-08-02 14:00`.
    pub hour: String,
    pub success: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayBucket {
    /// Bucket label, e.g. `2026-08-02`.
    pub day: String,
    pub success: u64,
    pub failed: u64,
}

/// Aggregates over the 14-day window.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    /// Percentage with one decimal, 0 when there is no traffic.
    pub success_rate: f64,
    /// Exactly 24 entries, oldest first.
    pub hourly: Vec<HourBucket>,
    /// Exactly 14 entries, oldest first.
    pub daily: Vec<DayBucket>,
}

const HOUR: i64 = 3_600;
const DAY: i64 = 86_400;

pub struct RequestLogStore {
    pool: SqlitePool,
}

impl RequestLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, entry: &RequestLogEntry) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO request_logs \
             (time, timestamp, ip, model, duration, status, key_name, token_suffix, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&entry.time)
        .bind(entry.timestamp)
        .bind(&entry.ip)
        .bind(&entry.model)
        .bind(entry.duration)
        .bind(entry.status)
        .bind(&entry.key_name)
        .bind(&entry.token_suffix)
        .bind(&entry.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<StatsReport, DbError> {
        self.stats_at(Utc::now()).await
    }

    /// Aggregate relative to `now` (injected for tests).
    pub async fn stats_at(&self, now: DateTime<Utc>) -> Result<StatsReport, DbError> {
        let now_ts = now.timestamp();
        let cutoff = now_ts - 14 * DAY;
        let hour_floor = now_ts - now_ts.rem_euclid(HOUR);
        let day_floor = now_ts - now_ts.rem_euclid(DAY);

        let rows = sqlx::query("SELECT timestamp, status FROM request_logs WHERE timestamp >= ?1")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        let mut hourly = vec![(0u64, 0u64); 24];
        let mut daily = vec![(0u64, 0u64); 14];
        let mut total = 0u64;
        let mut success_total = 0u64;

        for row in rows {
            let ts: i64 = row.get("timestamp");
            let status: i64 = row.get("status");
            if ts > now_ts {
                continue;
            }
            let success = (200..400).contains(&status);

            total += 1;
            if success {
                success_total += 1;
            }

            let hours_ago = (hour_floor - (ts - ts.rem_euclid(HOUR))) / HOUR;
            if (0..24).contains(&hours_ago) {
                let bucket = &mut hourly[(23 - hours_ago) as usize];
                if success {
                    bucket.0 += 1;
                } else {
                    bucket.1 += 1;
                }
            }

            let days_ago = (day_floor - (ts - ts.rem_euclid(DAY))) / DAY;
            if (0..14).contains(&days_ago) {
                let bucket = &mut daily[(13 - days_ago) as usize];
                if success {
                    bucket.0 += 1;
                } else {
                    bucket.1 += 1;
                }
            }
        }

        let success_rate = if total == 0 {
            0.0
        } else {
            (success_total as f64 / total as f64 * 1000.0).round() / 10.0
        };

        let hourly = hourly
            .into_iter()
            .enumerate()
            .map(|(i, (success, failed))| {
                let start = hour_floor - (23 - i as i64) * HOUR;
                HourBucket {
                    hour: label(start, "%Y-%m-%d %H:00"),
                    success,
                    failed,
                }
            })
            .collect();
        let daily = daily
            .into_iter()
            .enumerate()
            .map(|(i, (success, failed))| {
                let start = day_floor - (13 - i as i64) * DAY;
                DayBucket {
                    day: label(start, "%Y-%m-%d"),
                    success,
                    failed,
                }
            })
            .collect();

        Ok(StatsReport {
            total,
            success: success_total,
            failed: total - success_total,
            success_rate,
            hourly,
            daily,
        })
    }
}

fn label(ts: i64, format: &str) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format(format).to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::TimeZone;

    async fn store() -> RequestLogStore {
        RequestLogStore::new(db::connect_memory().await.unwrap())
    }

    fn entry(ts: i64, status: i64) -> RequestLogEntry {
        let mut entry = RequestLogEntry::at(DateTime::<Utc>::from_timestamp(ts, 0).unwrap());
        entry.status = status;
        entry.model = "grok-3".to_string();
        entry
    }

    #[tokio::test]
    async fn empty_log_yields_zero_rate_and_full_bucket_grids() {
        let store = store().await;
        let report = store.stats().await.unwrap();
        assert_eq!(report.total, 0);
        assert_eq!(report.success_rate, 0.0);
        assert_eq!(report.hourly.len(), 24);
        assert_eq!(report.daily.len(), 14);
    }

    #[tokio::test]
    async fn bucketization_over_three_hours() {
        let store = store().await;
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 15, 30, 0).unwrap();

        // Five requests across three UTC hours of the last 24h.
        for (offset, status) in [
            (0, 200),            // 15:30
            (HOUR, 200),         // 14:30
            (HOUR + 60, 404),    // 14:29
            (3 * HOUR, 200),     // 12:30
            (3 * HOUR + 10, 500) // 12:29
        ] {
            store
                .append(&entry(now.timestamp() - offset, status))
                .await
                .unwrap();
        }

        let report = store.stats_at(now).await.unwrap();
        assert_eq!(report.hourly.len(), 24);
        assert_eq!(report.daily.len(), 14);

        let bucketed: u64 = report.hourly.iter().map(|b| b.success + b.failed).sum();
        assert_eq!(bucketed, 5);

        // Newest bucket is the current hour.
        assert_eq!(report.hourly[23].hour, "2026-08-02 15:00");
        assert_eq!(report.hourly[23].success, 1);
        assert_eq!(report.hourly[22].success, 1);
        assert_eq!(report.hourly[22].failed, 1);
        assert_eq!(report.hourly[20].success, 1);
        assert_eq!(report.hourly[20].failed, 1);

        // All five land on today's daily bucket.
        assert_eq!(report.daily[13].day, "2026-08-02");
        assert_eq!(report.daily[13].success + report.daily[13].failed, 5);
    }

    #[tokio::test]
    async fn success_is_2xx_and_3xx() {
        let store = store().await;
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();
        for status in [200, 204, 302, 399, 400, 404, 500, 502] {
            store.append(&entry(now.timestamp(), status)).await.unwrap();
        }

        let report = store.stats_at(now).await.unwrap();
        assert_eq!(report.total, 8);
        assert_eq!(report.success, 4);
        assert_eq!(report.failed, 4);
        assert_eq!(report.success_rate, 50.0);
    }

    #[tokio::test]
    async fn success_rate_rounds_to_one_decimal() {
        let store = store().await;
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();
        // 2 of 3 succeed: 66.666… -> 66.7
        for status in [200, 200, 500] {
            store.append(&entry(now.timestamp(), status)).await.unwrap();
        }
        let report = store.stats_at(now).await.unwrap();
        assert_eq!(report.success_rate, 66.7);
    }

    #[tokio::test]
    async fn rows_outside_windows_are_excluded_from_buckets() {
        let store = store().await;
        let now = Utc.with_ymd_and_hms(2026, 8, 2, 12, 0, 0).unwrap();

        // 2 days ago: daily only. 20 days ago: excluded entirely.
        store
            .append(&entry(now.timestamp() - 2 * DAY, 200))
            .await
            .unwrap();
        store
            .append(&entry(now.timestamp() - 20 * DAY, 200))
            .await
            .unwrap();

        let report = store.stats_at(now).await.unwrap();
        assert_eq!(report.total, 1);
        let hourly_sum: u64 = report.hourly.iter().map(|b| b.success + b.failed).sum();
        assert_eq!(hourly_sum, 0);
        let daily_sum: u64 = report.daily.iter().map(|b| b.success + b.failed).sum();
        assert_eq!(daily_sum, 1);
        assert_eq!(report.daily[11].success, 1);
    }
}
