//! Outcome store — SQLite persistence and aggregation queries.
//!
//! The only stateful component on disk. One writer (the orchestrator),
//! concurrent readers (HTTP surface, calibration). All values enter queries
//! through binds; no field name in query text is ever derived from input.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::MedicError;
use crate::models::{DecisionOutcome, OutcomeRecord, OutcomeType};

/// Bumped whenever SCHEMA_SQL changes shape. A database with a different
/// version is rejected at startup.
const SCHEMA_VERSION: i64 = 1;

/// Retry policy for transient "database is locked" conditions.
const BUSY_RETRY_BASE_MS: u64 = 50;
const BUSY_RETRY_ATTEMPTS: u32 = 5;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS outcomes (
    outcome_id TEXT PRIMARY KEY,
    decision_id TEXT NOT NULL,
    kill_id TEXT NOT NULL,
    target_module TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    outcome_type TEXT NOT NULL,
    original_risk_score REAL NOT NULL,
    original_confidence REAL NOT NULL,
    original_decision TEXT NOT NULL,
    was_auto_approved INTEGER NOT NULL,
    time_to_healthy_seconds REAL,
    health_score_after REAL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_outcomes_recorded ON outcomes(recorded_at);
CREATE INDEX IF NOT EXISTS idx_outcomes_module ON outcomes(target_module);
CREATE INDEX IF NOT EXISTS idx_outcomes_type ON outcomes(outcome_type);
CREATE INDEX IF NOT EXISTS idx_outcomes_auto ON outcomes(was_auto_approved);
CREATE INDEX IF NOT EXISTS idx_outcomes_kill ON outcomes(kill_id);
"#;

/// Aggregated statistics over a rolling window.
#[derive(Debug, Clone, Serialize)]
pub struct OutcomeStatistics {
    pub window_days: i64,
    pub total: i64,
    pub success: i64,
    pub partial: i64,
    pub failure: i64,
    pub re_killed: i64,
    pub rollback: i64,
    pub undetermined: i64,
    pub auto_approved: i64,
    pub auto_approved_success: i64,
    /// success ∧ auto-approved over auto-approved; zero when nothing was
    /// auto-approved in the window.
    pub auto_approve_accuracy: f64,
    pub success_rate: f64,
    pub avg_time_to_healthy: f64,
}

/// Per-module aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStats {
    pub module: String,
    pub total: i64,
    pub success: i64,
    pub failure: i64,
    pub success_rate: f64,
    pub avg_risk_score: f64,
    pub avg_recovery_seconds: f64,
}

#[derive(Clone, Debug)]
pub struct OutcomeStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct OutcomeRow {
    outcome_id: String,
    decision_id: String,
    kill_id: String,
    target_module: String,
    recorded_at: DateTime<Utc>,
    outcome_type: String,
    original_risk_score: f64,
    original_confidence: f64,
    original_decision: String,
    was_auto_approved: bool,
    time_to_healthy_seconds: Option<f64>,
    health_score_after: Option<f64>,
    metadata: String,
}

impl From<OutcomeRow> for OutcomeRecord {
    fn from(row: OutcomeRow) -> Self {
        OutcomeRecord {
            outcome_id: Uuid::parse_str(&row.outcome_id).unwrap_or_default(),
            decision_id: Uuid::parse_str(&row.decision_id).unwrap_or_default(),
            kill_id: row.kill_id,
            target_module: row.target_module,
            recorded_at: row.recorded_at,
            outcome_type: OutcomeType::from_wire(&row.outcome_type)
                .unwrap_or(OutcomeType::Undetermined),
            original_risk_score: row.original_risk_score,
            original_confidence: row.original_confidence,
            original_decision: DecisionOutcome::from_wire(&row.original_decision)
                .unwrap_or(DecisionOutcome::Defer),
            was_auto_approved: row.was_auto_approved,
            time_to_healthy_seconds: row.time_to_healthy_seconds,
            health_score_after: row.health_score_after,
            metadata: serde_json::from_str(&row.metadata)
                .unwrap_or(serde_json::Value::Null),
        }
    }
}

impl OutcomeStore {
    /// Open (or create) the store at the given path and apply migrations.
    pub async fn open(path: &Path) -> Result<Self, MedicError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MedicError::Store(format!("cannot create data dir: {e}")))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        tracing::info!(path = %path.display(), "outcome store ready");
        Ok(store)
    }

    /// In-memory store for tests and local experiments.
    pub async fn open_in_memory() -> Result<Self, MedicError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), MedicError> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;

        match version {
            0 => {
                sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
                sqlx::raw_sql("PRAGMA user_version = 1")
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
            v if v == SCHEMA_VERSION => Ok(()),
            v => Err(MedicError::Store(format!(
                "schema version mismatch: database has {v}, expected {SCHEMA_VERSION}"
            ))),
        }
    }

    /// Append an outcome record. Durable on return; the caller may only
    /// acknowledge the source message after this succeeds.
    pub async fn put(&self, record: &OutcomeRecord) -> Result<(), MedicError> {
        let mut attempt = 0u32;
        loop {
            match self.try_put(record).await {
                Ok(()) => return Ok(()),
                Err(e) if is_busy(&e) && attempt + 1 < BUSY_RETRY_ATTEMPTS => {
                    let delay = BUSY_RETRY_BASE_MS << attempt;
                    tracing::warn!(
                        outcome_id = %record.outcome_id,
                        attempt,
                        delay_ms = delay,
                        "outcome store busy, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn try_put(&self, record: &OutcomeRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO outcomes (
                outcome_id, decision_id, kill_id, target_module, recorded_at,
                outcome_type, original_risk_score, original_confidence,
                original_decision, was_auto_approved, time_to_healthy_seconds,
                health_score_after, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.outcome_id.to_string())
        .bind(record.decision_id.to_string())
        .bind(&record.kill_id)
        .bind(&record.target_module)
        .bind(record.recorded_at)
        .bind(record.outcome_type.as_str())
        .bind(record.original_risk_score)
        .bind(record.original_confidence)
        .bind(record.original_decision.as_str())
        .bind(record.was_auto_approved)
        .bind(record.time_to_healthy_seconds)
        .bind(record.health_score_after)
        .bind(record.metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent records, newest first.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<OutcomeRecord>, MedicError> {
        let rows: Vec<OutcomeRow> = sqlx::query_as(
            "SELECT * FROM outcomes ORDER BY recorded_at DESC, outcome_id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(OutcomeRecord::from).collect())
    }

    /// Count of re-killed/failed outcomes for a module within a rolling
    /// window. Feeds the engine's false-positive-history factor.
    pub async fn module_history(
        &self,
        target_module: &str,
        window_days: i64,
    ) -> Result<i64, MedicError> {
        let cutoff = Utc::now() - ChronoDuration::days(window_days);
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM outcomes
            WHERE target_module = ?
              AND outcome_type IN ('re_killed', 'failure')
              AND recorded_at >= ?
            "#,
        )
        .bind(target_module)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// All-time aggregation for a single module.
    pub async fn module_stats(&self, target_module: &str) -> Result<ModuleStats, MedicError> {
        let row: (i64, i64, i64, Option<f64>, Option<f64>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN outcome_type = 'success' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN outcome_type IN ('failure', 'rollback') THEN 1 ELSE 0 END), 0),
                AVG(original_risk_score),
                AVG(time_to_healthy_seconds)
            FROM outcomes
            WHERE target_module = ?
            "#,
        )
        .bind(target_module)
        .fetch_one(&self.pool)
        .await?;

        let (total, success, failure, avg_risk, avg_recovery) = row;
        Ok(ModuleStats {
            module: target_module.to_string(),
            total,
            success,
            failure,
            success_rate: if total > 0 {
                success as f64 / total as f64
            } else {
                0.0
            },
            avg_risk_score: avg_risk.unwrap_or(0.0),
            avg_recovery_seconds: avg_recovery.unwrap_or(0.0),
        })
    }

    /// Aggregate counts and accuracy over a rolling window.
    pub async fn statistics(&self, window_days: i64) -> Result<OutcomeStatistics, MedicError> {
        let cutoff = Utc::now() - ChronoDuration::days(window_days);

        let counts: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT outcome_type, COUNT(*)
            FROM outcomes
            WHERE recorded_at >= ?
            GROUP BY outcome_type
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = OutcomeStatistics {
            window_days,
            total: 0,
            success: 0,
            partial: 0,
            failure: 0,
            re_killed: 0,
            rollback: 0,
            undetermined: 0,
            auto_approved: 0,
            auto_approved_success: 0,
            auto_approve_accuracy: 0.0,
            success_rate: 0.0,
            avg_time_to_healthy: 0.0,
        };

        for (ty, count) in counts {
            stats.total += count;
            match OutcomeType::from_wire(&ty) {
                Some(OutcomeType::Success) => stats.success = count,
                Some(OutcomeType::PartialSuccess) => stats.partial = count,
                Some(OutcomeType::Failure) => stats.failure = count,
                Some(OutcomeType::ReKilled) => stats.re_killed = count,
                Some(OutcomeType::Rollback) => stats.rollback = count,
                Some(OutcomeType::Undetermined) | None => stats.undetermined += count,
            }
        }

        let auto: (i64, i64, Option<f64>) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN was_auto_approved = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN was_auto_approved = 1 AND outcome_type = 'success' THEN 1 ELSE 0 END), 0),
                AVG(CASE WHEN outcome_type = 'success' THEN time_to_healthy_seconds END)
            FROM outcomes
            WHERE recorded_at >= ?
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        stats.auto_approved = auto.0;
        stats.auto_approved_success = auto.1;
        stats.avg_time_to_healthy = auto.2.unwrap_or(0.0);
        if stats.auto_approved > 0 {
            stats.auto_approve_accuracy =
                stats.auto_approved_success as f64 / stats.auto_approved as f64;
        }
        if stats.total > 0 {
            stats.success_rate = stats.success as f64 / stats.total as f64;
        }

        Ok(stats)
    }

    /// Dedupe check: has this kill already produced a record recently?
    pub async fn recent_kill_exists(
        &self,
        kill_id: &str,
        within_hours: i64,
    ) -> Result<bool, MedicError> {
        let cutoff = Utc::now() - ChronoDuration::hours(within_hours);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outcomes WHERE kill_id = ? AND recorded_at >= ?",
        )
        .bind(kill_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Decision, DecisionOutcome, RiskLevel};
    use chrono::Duration as ChronoDuration;

    fn record(
        kill_id: &str,
        module: &str,
        outcome_type: OutcomeType,
        auto: bool,
        recorded_at: DateTime<Utc>,
    ) -> OutcomeRecord {
        let decision = Decision {
            decision_id: Uuid::new_v4(),
            kill_id: kill_id.to_string(),
            timestamp: recorded_at,
            outcome: if auto {
                DecisionOutcome::ApproveAuto
            } else {
                DecisionOutcome::PendingReview
            },
            risk_level: RiskLevel::Low,
            risk_score: 0.25,
            confidence: 0.9,
            reasoning: vec![],
            recommended_action: String::new(),
            requires_human_review: !auto,
            timeout_minutes: 60,
        };
        let mut rec = OutcomeRecord::from_decision(&decision, module);
        rec.outcome_type = outcome_type;
        rec.recorded_at = recorded_at;
        if outcome_type == OutcomeType::Success {
            rec.time_to_healthy_seconds = Some(4.0);
            rec.health_score_after = Some(1.0);
        }
        rec
    }

    #[tokio::test]
    async fn test_open_creates_file_and_checks_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("outcomes.db");

        let store = OutcomeStore::open(&path).await.unwrap();
        store
            .put(&record("k1", "svc", OutcomeType::Success, true, Utc::now()))
            .await
            .unwrap();
        drop(store);

        // Reopen: same schema generation, data intact.
        let store = OutcomeStore::open(&path).await.unwrap();
        assert_eq!(store.list_recent(10).await.unwrap().len(), 1);

        // A database from a different schema generation is rejected.
        sqlx::raw_sql("PRAGMA user_version = 9")
            .execute(&store.pool)
            .await
            .unwrap();
        drop(store);
        let err = OutcomeStore::open(&path).await.unwrap_err();
        assert!(matches!(err, MedicError::Store(_)));
    }

    #[tokio::test]
    async fn test_put_and_list_recent_ordering() {
        let store = OutcomeStore::open_in_memory().await.unwrap();
        let base = Utc::now();
        for i in 0..5 {
            let rec = record(
                &format!("k{i}"),
                "auth-service",
                OutcomeType::Success,
                true,
                base + ChronoDuration::seconds(i),
            );
            store.put(&rec).await.unwrap();
        }

        let recent = store.list_recent(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].kill_id, "k4");
        assert_eq!(recent[2].kill_id, "k2");

        // Repeated reads with no writes are identical.
        let again = store.list_recent(3).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|r| r.outcome_id).collect();
        let ids_again: Vec<_> = again.iter().map(|r| r.outcome_id).collect();
        assert_eq!(ids, ids_again);
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let store = OutcomeStore::open_in_memory().await.unwrap();
        let mut rec = record("k1", "api-gateway", OutcomeType::Rollback, false, Utc::now());
        rec.metadata = serde_json::json!({"reason": "health_timeout"});
        store.put(&rec).await.unwrap();

        let got = &store.list_recent(1).await.unwrap()[0];
        assert_eq!(got.outcome_id, rec.outcome_id);
        assert_eq!(got.decision_id, rec.decision_id);
        assert_eq!(got.outcome_type, OutcomeType::Rollback);
        assert_eq!(got.original_decision, DecisionOutcome::PendingReview);
        assert!(!got.was_auto_approved);
        assert_eq!(got.metadata["reason"], "health_timeout");
    }

    #[tokio::test]
    async fn test_module_history_counts_failures_in_window() {
        let store = OutcomeStore::open_in_memory().await.unwrap();
        let now = Utc::now();

        store
            .put(&record("k1", "worker", OutcomeType::Failure, false, now))
            .await
            .unwrap();
        store
            .put(&record("k2", "worker", OutcomeType::ReKilled, false, now))
            .await
            .unwrap();
        store
            .put(&record("k3", "worker", OutcomeType::Success, false, now))
            .await
            .unwrap();
        // Outside the window.
        store
            .put(&record(
                "k4",
                "worker",
                OutcomeType::Failure,
                false,
                now - ChronoDuration::days(45),
            ))
            .await
            .unwrap();
        // Different module.
        store
            .put(&record("k5", "other", OutcomeType::Failure, false, now))
            .await
            .unwrap();

        assert_eq!(store.module_history("worker", 30).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_statistics_accuracy() {
        let store = OutcomeStore::open_in_memory().await.unwrap();
        let now = Utc::now();

        // Empty store: zero denominator means zero accuracy, not NaN.
        let empty = store.statistics(30).await.unwrap();
        assert_eq!(empty.auto_approve_accuracy, 0.0);
        assert_eq!(empty.total, 0);

        for i in 0..8 {
            store
                .put(&record(
                    &format!("a{i}"),
                    "svc",
                    OutcomeType::Success,
                    true,
                    now + ChronoDuration::milliseconds(i),
                ))
                .await
                .unwrap();
        }
        for i in 0..2 {
            store
                .put(&record(
                    &format!("f{i}"),
                    "svc",
                    OutcomeType::Failure,
                    true,
                    now + ChronoDuration::milliseconds(100 + i),
                ))
                .await
                .unwrap();
        }
        store
            .put(&record("m1", "svc", OutcomeType::Undetermined, false, now))
            .await
            .unwrap();

        let stats = store.statistics(30).await.unwrap();
        assert_eq!(stats.total, 11);
        assert_eq!(stats.auto_approved, 10);
        assert_eq!(stats.auto_approved_success, 8);
        assert!((stats.auto_approve_accuracy - 0.8).abs() < 1e-9);
        assert_eq!(stats.success, 8);
        assert_eq!(stats.failure, 2);
        assert_eq!(stats.undetermined, 1);
    }

    #[tokio::test]
    async fn test_recent_kill_dedupe_window() {
        let store = OutcomeStore::open_in_memory().await.unwrap();
        let now = Utc::now();

        store
            .put(&record("fresh", "svc", OutcomeType::Success, true, now))
            .await
            .unwrap();
        store
            .put(&record(
                "stale",
                "svc",
                OutcomeType::Success,
                true,
                now - ChronoDuration::hours(30),
            ))
            .await
            .unwrap();

        assert!(store.recent_kill_exists("fresh", 24).await.unwrap());
        assert!(!store.recent_kill_exists("stale", 24).await.unwrap());
        assert!(!store.recent_kill_exists("unknown", 24).await.unwrap());
    }

    #[tokio::test]
    async fn test_module_stats() {
        let store = OutcomeStore::open_in_memory().await.unwrap();
        let now = Utc::now();

        for i in 0..3 {
            store
                .put(&record(
                    &format!("s{i}"),
                    "db",
                    OutcomeType::Success,
                    true,
                    now + ChronoDuration::milliseconds(i),
                ))
                .await
                .unwrap();
        }
        store
            .put(&record("f1", "db", OutcomeType::Failure, false, now))
            .await
            .unwrap();

        let stats = store.module_stats("db").await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.success, 3);
        assert_eq!(stats.failure, 1);
        assert!((stats.success_rate - 0.75).abs() < 1e-9);

        let none = store.module_stats("ghost").await.unwrap();
        assert_eq!(none.total, 0);
        assert_eq!(none.success_rate, 0.0);
    }
}
