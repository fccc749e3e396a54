//! libSQL backend: durable object storage, the budget alert ledger and
//! metered usage.
//!
//! Supports local file and in-memory databases.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::cost::{AlertLedger, BillingPeriod, BudgetAlert, FiredThreshold, UsageStore, UsageTotals};
use crate::error::{CostError, DatabaseError, StoreError};
use crate::store::migrations;
use crate::store::traits::{ArtifactMeta, ObjectBackend, TagSet};

const META_COLUMNS: &str = "key, size, created_at, tags, tag_applied_at";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and ephemeral runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn find_meta(&self, key: &str) -> Result<Option<ArtifactMeta>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {META_COLUMNS} FROM artifacts WHERE key = ?1"),
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("head_object: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_meta(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("head_object: {e}"))),
        }
    }

    async fn find_body(&self, key: &str) -> Result<Option<Vec<u8>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT body FROM artifacts WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_object: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<Vec<u8>>(0)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_object row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_object: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("timestamp {s:?}: {e}")))
}

/// JSON path for one tag key. Keys are quoted so dots and brackets stay literal.
fn tag_path(key: &str) -> Result<String, StoreError> {
    if key.is_empty() || key.contains(['"', '\\']) {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
            reason: "tag keys must be non-empty and free of quotes and backslashes".into(),
        });
    }
    Ok(format!("$.\"{key}\""))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn row_to_meta(row: &libsql::Row) -> Result<ArtifactMeta, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("artifact row parse: {e}"));

    let key: String = row.get(0).map_err(parse)?;
    let size: i64 = row.get(1).map_err(parse)?;
    let created_at: String = row.get(2).map_err(parse)?;
    let tags: String = row.get(3).map_err(parse)?;
    let tag_applied_at: String = row.get(4).map_err(parse)?;

    let tags: TagSet =
        serde_json::from_str(&tags).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let tag_applied_at: BTreeMap<String, DateTime<Utc>> = serde_json::from_str(&tag_applied_at)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(ArtifactMeta {
        key,
        size: size as u64,
        created_at: parse_datetime(&created_at)?,
        tags,
        tag_applied_at,
    })
}

fn not_found(key: &str) -> StoreError {
    StoreError::NotFound {
        key: key.to_string(),
    }
}

// ── Object storage ──────────────────────────────────────────────────

#[async_trait]
impl ObjectBackend for LibSqlBackend {
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        tags: TagSet,
        now: DateTime<Utc>,
    ) -> Result<ArtifactMeta, StoreError> {
        let meta = ArtifactMeta::new(key, body.len() as u64, tags, now);

        let inserted = self
            .conn()
            .execute(
                "INSERT INTO artifacts (key, body, size, created_at, tags, tag_applied_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6) ON CONFLICT(key) DO NOTHING",
                params![
                    key,
                    Value::Blob(body.clone()),
                    meta.size as i64,
                    meta.created_at.to_rfc3339(),
                    to_json(&meta.tags)?,
                    to_json(&meta.tag_applied_at)?,
                ],
            )
            .await
            .map_err(|e| StoreError::WriteFailure {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        if inserted == 1 {
            debug!(key = %key, size = meta.size, "Artifact row inserted");
            return Ok(meta);
        }

        // Key already present: identical bytes are an idempotent retry.
        let existing = self.find_body(key).await?.ok_or_else(|| not_found(key))?;
        if existing != body {
            return Err(StoreError::WriteFailure {
                key: key.to_string(),
                reason: "object already exists with different content".into(),
            });
        }
        self.find_meta(key).await?.ok_or_else(|| not_found(key))
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.find_body(key).await?.ok_or_else(|| not_found(key))
    }

    async fn head_object(&self, key: &str) -> Result<ArtifactMeta, StoreError> {
        self.find_meta(key).await?.ok_or_else(|| not_found(key))
    }

    async fn tag_object(
        &self,
        key: &str,
        tags: &TagSet,
        now: DateTime<Utc>,
    ) -> Result<ArtifactMeta, StoreError> {
        // One read-modify-write statement per tag key, so concurrent taggers
        // never overwrite each other's keys. The applied-at time only moves
        // when the value changes; SET expressions see the pre-update row.
        for (tag, value) in tags {
            let updated = self
                .conn()
                .execute(
                    "UPDATE artifacts SET \
                         tag_applied_at = CASE WHEN json_extract(tags, ?2) IS ?3 \
                             THEN tag_applied_at ELSE json_set(tag_applied_at, ?2, ?4) END, \
                         tags = json_set(tags, ?2, ?3) \
                     WHERE key = ?1",
                    params![key, tag_path(tag)?, value.as_str(), now.to_rfc3339()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("tag_object: {e}")))?;
            if updated == 0 {
                return Err(not_found(key));
            }
        }
        self.find_meta(key).await?.ok_or_else(|| not_found(key))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ArtifactMeta>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {META_COLUMNS} FROM artifacts WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key"
                ),
                params![prefix],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_objects: {e}")))?;

        let mut objects = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_objects: {e}")))?
        {
            // Unreadable rows are skipped so the sweep never acts on them.
            match row_to_meta(&row) {
                Ok(meta) => objects.push(meta),
                Err(e) => {
                    let key = row.get::<String>(0).unwrap_or_default();
                    warn!(key = %key, error = %e, "Skipping artifact with unreadable metadata");
                }
            }
        }
        Ok(objects)
    }

    async fn delete_object(&self, key: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM artifacts WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_object: {e}")))?;
        Ok(deleted > 0)
    }
}

// ── Budget alert ledger ─────────────────────────────────────────────

#[async_trait]
impl AlertLedger for LibSqlBackend {
    async fn fired_thresholds(
        &self,
        budget_name: &str,
        period: BillingPeriod,
    ) -> Result<Vec<FiredThreshold>, CostError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT threshold, fired_at FROM budget_alerts WHERE budget_name = ?1 AND period = ?2",
                params![budget_name, period.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fired_thresholds: {e}")))?;

        let mut fired = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("fired_thresholds: {e}")))?
        {
            let threshold: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("fired_thresholds row parse: {e}")))?;
            let fired_at: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("fired_thresholds row parse: {e}")))?;
            let threshold = Decimal::from_str(&threshold)
                .map_err(|e| DatabaseError::Serialization(format!("threshold {threshold}: {e}")))?;
            fired.push(FiredThreshold {
                threshold,
                fired_at: parse_datetime(&fired_at)?,
            });
        }
        Ok(fired)
    }

    async fn record_fired(
        &self,
        alert: &BudgetAlert,
        period: BillingPeriod,
        fired_at: DateTime<Utc>,
    ) -> Result<(), CostError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO budget_alerts (budget_name, period, threshold, actual_amount, fired_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    alert.budget_name.as_str(),
                    period.to_string(),
                    alert.threshold_percent.normalize().to_string(),
                    alert.actual_amount.to_string(),
                    fired_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_fired: {e}")))?;
        debug!(
            budget = %alert.budget_name,
            period = %period,
            threshold = %alert.threshold_percent,
            "Fired threshold recorded"
        );
        Ok(())
    }
}

// ── Metered usage ───────────────────────────────────────────────────

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl UsageStore for LibSqlBackend {
    async fn add_usage(
        &self,
        period: BillingPeriod,
        delta: UsageTotals,
        at: DateTime<Utc>,
    ) -> Result<(), CostError> {
        self.conn()
            .execute(
                "INSERT INTO usage_totals (period, memory_mb_ms, requests, updated_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(period) DO UPDATE SET \
                     memory_mb_ms = memory_mb_ms + excluded.memory_mb_ms, \
                     requests = requests + excluded.requests, \
                     updated_at = excluded.updated_at",
                params![
                    period.to_string(),
                    to_i64(delta.memory_mb_ms),
                    to_i64(delta.requests),
                    at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_usage: {e}")))?;
        Ok(())
    }

    async fn usage(&self, period: BillingPeriod) -> Result<UsageTotals, CostError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT memory_mb_ms, requests FROM usage_totals WHERE period = ?1",
                params![period.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("usage: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("usage: {e}")))?;
        let Some(row) = row else {
            return Ok(UsageTotals::default());
        };

        let parse = |e: libsql::Error| DatabaseError::Query(format!("usage row parse: {e}"));
        let memory_mb_ms: i64 = row.get(0).map_err(parse)?;
        let requests: i64 = row.get(1).map_err(parse)?;
        Ok(UsageTotals {
            memory_mb_ms: memory_mb_ms.max(0) as u64,
            requests: requests.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::COMPARATOR;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn put_get_head() {
        let db = test_db().await;
        let now = Utc::now();
        let meta = db
            .put_object("raw-emails/a", b"mime bytes".to_vec(), TagSet::new(), now)
            .await
            .unwrap();
        assert_eq!(meta.size, 10);

        assert_eq!(db.get_object("raw-emails/a").await.unwrap(), b"mime bytes");
        let head = db.head_object("raw-emails/a").await.unwrap();
        assert_eq!(head.key, "raw-emails/a");
        assert_eq!(head.created_at.timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let db = test_db().await;
        assert!(matches!(
            db.get_object("raw-emails/missing").await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            db.tag_object("raw-emails/missing", &tags(&[("status", "processed")]), Utc::now())
                .await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn rewrite_is_idempotent_only_for_same_bytes() {
        let db = test_db().await;
        let first = Utc::now();
        db.put_object("raw-emails/a", b"one".to_vec(), TagSet::new(), first)
            .await
            .unwrap();

        let again = db
            .put_object("raw-emails/a", b"one".to_vec(), TagSet::new(), Utc::now())
            .await
            .unwrap();
        assert_eq!(again.created_at.timestamp(), first.timestamp());

        assert!(matches!(
            db.put_object("raw-emails/a", b"two".to_vec(), TagSet::new(), Utc::now())
                .await,
            Err(StoreError::WriteFailure { .. })
        ));
    }

    #[tokio::test]
    async fn tags_persist_with_applied_time() {
        let db = test_db().await;
        let created = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let tagged = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        db.put_object("raw-emails/a", b"x".to_vec(), TagSet::new(), created)
            .await
            .unwrap();

        db.tag_object("raw-emails/a", &tags(&[("status", "processed")]), tagged)
            .await
            .unwrap();
        // Re-tagging with the same value keeps the original time.
        db.tag_object(
            "raw-emails/a",
            &tags(&[("status", "processed")]),
            Utc.with_ymd_and_hms(2026, 3, 5, 0, 0, 0).unwrap(),
        )
        .await
        .unwrap();

        let head = db.head_object("raw-emails/a").await.unwrap();
        assert_eq!(head.tag("status"), Some("processed"));
        assert_eq!(head.tag_applied_at("status"), Some(tagged));
    }

    #[tokio::test]
    async fn concurrent_tags_on_different_keys_both_land() {
        let db = test_db().await;
        let now = Utc::now();
        db.put_object("raw-emails/a", b"x".to_vec(), TagSet::new(), now)
            .await
            .unwrap();

        let status = tags(&[("status", "processed")]);
        let source = tags(&[("source", "relay")]);
        let (a, b) = tokio::join!(
            db.tag_object("raw-emails/a", &status, now),
            db.tag_object("raw-emails/a", &source, now),
        );
        a.unwrap();
        b.unwrap();

        let head = db.head_object("raw-emails/a").await.unwrap();
        assert_eq!(head.tag("status"), Some("processed"));
        assert_eq!(head.tag("source"), Some("relay"));
        assert!(head.tag_applied_at("status").is_some());
        assert!(head.tag_applied_at("source").is_some());
    }

    #[tokio::test]
    async fn tag_keys_with_quotes_are_rejected() {
        let db = test_db().await;
        db.put_object("raw-emails/a", b"x".to_vec(), TagSet::new(), Utc::now())
            .await
            .unwrap();
        let err = db
            .tag_object("raw-emails/a", &tags(&[("a\"b", "v")]), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
        assert!(db.head_object("raw-emails/a").await.unwrap().tags.is_empty());
    }

    #[tokio::test]
    async fn unreadable_timestamps_are_errors_not_epoch() {
        let db = test_db().await;
        let now = Utc::now();
        for key in ["raw-emails/good", "raw-emails/bad"] {
            db.put_object(key, b"x".to_vec(), TagSet::new(), now)
                .await
                .unwrap();
        }
        db.conn()
            .execute(
                "UPDATE artifacts SET created_at = 'last tuesday' WHERE key = ?1",
                params!["raw-emails/bad"],
            )
            .await
            .unwrap();

        assert!(matches!(
            db.head_object("raw-emails/bad").await,
            Err(StoreError::Backend(DatabaseError::Serialization(_)))
        ));
        let keys: Vec<String> = db
            .list_objects("raw-emails/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, vec!["raw-emails/good"]);
        assert_eq!(db.get_object("raw-emails/bad").await.unwrap(), b"x");
    }

    #[test]
    fn sqlite_datetime_format_is_accepted() {
        assert_eq!(
            parse_datetime("2026-03-01 12:30:00").unwrap(),
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap()
        );
        assert!(parse_datetime("").is_err());
    }

    #[tokio::test]
    async fn usage_accumulates_per_period() {
        let db = test_db().await;
        let march = BillingPeriod {
            year: 2026,
            month: 3,
        };
        let delta = UsageTotals {
            memory_mb_ms: 1_024_000,
            requests: 1,
        };
        assert_eq!(db.usage(march).await.unwrap(), UsageTotals::default());

        db.add_usage(march, delta, Utc::now()).await.unwrap();
        db.add_usage(march, delta, Utc::now()).await.unwrap();

        let totals = db.usage(march).await.unwrap();
        assert_eq!(totals.memory_mb_ms, 2_048_000);
        assert_eq!(totals.requests, 2);
        assert_eq!(totals.gb_seconds(), dec!(2));
        assert_eq!(db.usage(march.next()).await.unwrap(), UsageTotals::default());
    }

    #[tokio::test]
    async fn list_by_prefix_in_key_order() {
        let db = test_db().await;
        let now = Utc::now();
        for key in ["raw-emails/b", "other/x", "raw-emails/a", "raw-emailsX"] {
            db.put_object(key, b"x".to_vec(), TagSet::new(), now)
                .await
                .unwrap();
        }
        let keys: Vec<String> = db
            .list_objects("raw-emails/")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, vec!["raw-emails/a", "raw-emails/b"]);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let db = test_db().await;
        db.put_object("raw-emails/a", b"x".to_vec(), TagSet::new(), Utc::now())
            .await
            .unwrap();
        assert!(db.delete_object("raw-emails/a").await.unwrap());
        assert!(!db.delete_object("raw-emails/a").await.unwrap());
    }

    #[tokio::test]
    async fn artifacts_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intake.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.put_object("raw-emails/a", b"durable".to_vec(), TagSet::new(), Utc::now())
                .await
                .unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.get_object("raw-emails/a").await.unwrap(), b"durable");
    }

    #[tokio::test]
    async fn ledger_round_trip() {
        let db = test_db().await;
        let period = BillingPeriod {
            year: 2026,
            month: 3,
        };
        let fired_at = Utc.with_ymd_and_hms(2026, 3, 5, 12, 0, 0).unwrap();
        let alert = BudgetAlert {
            budget_name: "hsa-receipt-archiver-monthly".into(),
            threshold_percent: dec!(80),
            comparator: COMPARATOR.into(),
            limit_amount: dec!(10),
            currency: "USD".into(),
            actual_amount: dec!(8.5),
            billing_period: period.to_string(),
        };
        db.record_fired(&alert, period, fired_at).await.unwrap();
        db.record_fired(&alert, period, Utc::now()).await.unwrap();

        let fired = db
            .fired_thresholds("hsa-receipt-archiver-monthly", period)
            .await
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].threshold, dec!(80));
        assert_eq!(fired[0].fired_at, fired_at);
        assert!(
            db.fired_thresholds("hsa-receipt-archiver-monthly", period.next())
                .await
                .unwrap()
                .is_empty()
        );
    }
}
