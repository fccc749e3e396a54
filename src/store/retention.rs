//! Tag-conditional retention rules and the background sweep that enforces them.
//!
//! Expiration is never cached. It is derived from an object's current metadata
//! every time it is asked for, so tagging an object takes effect immediately.
//!
//! Resolution for one object:
//! 1. Collect every rule whose prefix covers the key and whose tag filter (if any)
//!    matches the current tags.
//! 2. The most specific rule governs: tag-filtered over unfiltered, then the
//!    longer prefix, then declaration order.
//! 3. The deadline is the earliest deadline among all matching rules, so adding
//!    a tag can shorten an object's lifetime but never extend it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::store::Bucket;
use crate::store::traits::ArtifactMeta;

/// Matches objects carrying `key=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pub key: String,
    pub value: String,
}

impl TagFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One lifecycle rule.
#[derive(Debug, Clone)]
pub struct RetentionRule {
    pub id: String,
    pub prefix: String,
    pub tag_filter: Option<TagFilter>,
    /// Time to live, counted from creation (unfiltered) or from when the
    /// filter tag was applied (tag-filtered).
    pub expiration: chrono::Duration,
}

impl RetentionRule {
    pub fn new(id: impl Into<String>, prefix: impl Into<String>, expiration: chrono::Duration) -> Self {
        Self {
            id: id.into(),
            prefix: prefix.into(),
            tag_filter: None,
            expiration,
        }
    }

    pub fn with_tag_filter(mut self, filter: TagFilter) -> Self {
        self.tag_filter = Some(filter);
        self
    }

    fn matches(&self, meta: &ArtifactMeta) -> bool {
        if !meta.key.starts_with(&self.prefix) {
            return false;
        }
        match &self.tag_filter {
            Some(f) => meta.tag(&f.key) == Some(f.value.as_str()),
            None => true,
        }
    }

    fn deadline(&self, meta: &ArtifactMeta) -> DateTime<Utc> {
        let anchor = self
            .tag_filter
            .as_ref()
            .and_then(|f| meta.tag_applied_at(&f.key))
            .unwrap_or(meta.created_at);
        anchor + self.expiration
    }

    fn specificity(&self) -> (bool, usize) {
        (self.tag_filter.is_some(), self.prefix.len())
    }
}

/// The outcome of evaluating retention for one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetentionDecision {
    /// The most specific matching rule.
    pub rule_id: String,
    pub expires_at: DateTime<Utc>,
    /// Set when a less specific rule's deadline came first.
    pub clamped_by: Option<String>,
}

/// Evaluates a fixed rule set.
#[derive(Debug, Clone, Default)]
pub struct RetentionEngine {
    rules: Vec<RetentionRule>,
}

impl RetentionEngine {
    pub fn new(rules: Vec<RetentionRule>) -> Self {
        Self { rules }
    }

    /// Resolve the governing rule and deadline for an object in its current state.
    pub fn evaluate(&self, meta: &ArtifactMeta) -> Option<RetentionDecision> {
        let matching: Vec<&RetentionRule> = self.rules.iter().filter(|r| r.matches(meta)).collect();

        // First declared wins ties.
        let governing = matching.iter().copied().fold(None::<&RetentionRule>, |best, r| match best {
            Some(b) if b.specificity() >= r.specificity() => Some(b),
            _ => Some(r),
        })?;

        let governing_deadline = governing.deadline(meta);
        let earliest = matching
            .iter()
            .map(|r| (r, r.deadline(meta)))
            .min_by_key(|(_, d)| *d)?;

        let clamped_by = (earliest.1 < governing_deadline).then(|| earliest.0.id.clone());

        Some(RetentionDecision {
            rule_id: governing.id.clone(),
            expires_at: earliest.1,
            clamped_by,
        })
    }

    pub fn is_expired(&self, meta: &ArtifactMeta, now: DateTime<Utc>) -> bool {
        self.evaluate(meta).is_some_and(|d| d.expires_at <= now)
    }

    /// Distinct rule prefixes, shortest first, with nested prefixes removed.
    fn sweep_prefixes(&self) -> Vec<&str> {
        let mut prefixes: Vec<&str> = self.rules.iter().map(|r| r.prefix.as_str()).collect();
        prefixes.sort_by_key(|p| p.len());
        prefixes.dedup();
        let mut roots: Vec<&str> = Vec::new();
        for p in prefixes {
            if !roots.iter().any(|root| p.starts_with(root)) {
                roots.push(p);
            }
        }
        roots
    }
}

/// Summary of one sweep pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: Vec<String>,
    pub failed: usize,
}

/// Deletes objects whose computed expiration has passed.
pub struct RetentionSweeper {
    bucket: Arc<Bucket>,
}

impl RetentionSweeper {
    pub fn new(bucket: Arc<Bucket>) -> Self {
        Self { bucket }
    }

    /// Run one pass as of `now`. Individual delete failures are logged and
    /// counted; listing failures abort the pass.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let engine = self.bucket.retention();
        let mut report = SweepReport::default();

        for prefix in engine.sweep_prefixes() {
            let objects = self.bucket.list(prefix).await?;
            for meta in objects {
                report.scanned += 1;
                if !engine.is_expired(&meta, now) {
                    continue;
                }
                match self.bucket.delete(&meta.key).await {
                    Ok(_) => {
                        debug!(key = %meta.key, "Expired artifact removed");
                        report.deleted.push(meta.key);
                    }
                    Err(e) => {
                        warn!(key = %meta.key, error = %e, "Failed to delete expired artifact");
                        report.failed += 1;
                    }
                }
            }
        }

        if !report.deleted.is_empty() || report.failed > 0 {
            info!(
                bucket = %self.bucket.name(),
                scanned = report.scanned,
                deleted = report.deleted.len(),
                failed = report.failed,
                "Retention sweep complete"
            );
        }
        Ok(report)
    }
}

/// Spawn a background task that sweeps expired artifacts every `interval`.
pub fn spawn_retention_sweep(
    sweeper: Arc<RetentionSweeper>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper.sweep(Utc::now()).await {
                error!(error = %e, "Retention sweep failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntakeConfig;
    use crate::store::traits::TagSet;
    use crate::store::MemoryBackend;

    fn days(n: i64) -> chrono::Duration {
        chrono::Duration::days(n)
    }

    fn engine() -> RetentionEngine {
        RetentionEngine::new(IntakeConfig::default().retention_rules())
    }

    fn processed() -> TagSet {
        TagSet::from([("status".to_string(), "processed".to_string())])
    }

    #[test]
    fn untagged_expires_thirty_days_after_creation() {
        let created = Utc::now();
        let meta = ArtifactMeta::new("raw-emails/a", 1, TagSet::new(), created);
        let decision = engine().evaluate(&meta).unwrap();
        assert_eq!(decision.rule_id, "raw-emails");
        assert_eq!(decision.expires_at, created + days(30));
        assert!(decision.clamped_by.is_none());
    }

    #[test]
    fn tagging_recomputes_from_tag_time() {
        let created = Utc::now();
        let tagged = created + days(2);
        let mut meta = ArtifactMeta::new("raw-emails/a", 1, TagSet::new(), created);
        meta.apply_tags(&processed(), tagged);

        let decision = engine().evaluate(&meta).unwrap();
        assert_eq!(decision.rule_id, "processed-raw-emails");
        assert_eq!(decision.expires_at, tagged + days(7));
    }

    #[test]
    fn late_tagging_never_lengthens_lifetime() {
        let created = Utc::now();
        let tagged = created + days(28);
        let before = ArtifactMeta::new("raw-emails/a", 1, TagSet::new(), created);
        let mut after = before.clone();
        after.apply_tags(&processed(), tagged);

        let e = engine();
        let before_deadline = e.evaluate(&before).unwrap().expires_at;
        let decision = e.evaluate(&after).unwrap();
        assert_eq!(decision.rule_id, "processed-raw-emails");
        assert_eq!(decision.expires_at, created + days(30));
        assert_eq!(decision.clamped_by.as_deref(), Some("raw-emails"));
        assert!(decision.expires_at <= before_deadline);
    }

    #[test]
    fn other_tags_do_not_trigger_filtered_rule() {
        let created = Utc::now();
        let mut meta = ArtifactMeta::new("raw-emails/a", 1, TagSet::new(), created);
        meta.apply_tags(
            &TagSet::from([("status".to_string(), "failed".to_string())]),
            created,
        );
        assert_eq!(engine().evaluate(&meta).unwrap().rule_id, "raw-emails");
    }

    #[test]
    fn keys_outside_prefix_have_no_rule() {
        let meta = ArtifactMeta::new("receipts/2025/a.pdf", 1, TagSet::new(), Utc::now());
        assert!(engine().evaluate(&meta).is_none());
        assert!(!engine().is_expired(&meta, Utc::now() + days(3650)));
    }

    #[test]
    fn longer_prefix_is_more_specific() {
        let engine = RetentionEngine::new(vec![
            RetentionRule::new("all", "", days(90)),
            RetentionRule::new("raw", "raw-emails/", days(30)),
        ]);
        let meta = ArtifactMeta::new("raw-emails/a", 1, TagSet::new(), Utc::now());
        assert_eq!(engine.evaluate(&meta).unwrap().rule_id, "raw");
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let engine = RetentionEngine::new(vec![
            RetentionRule::new("first", "raw-emails/", days(10)),
            RetentionRule::new("second", "raw-emails/", days(20)),
        ]);
        let meta = ArtifactMeta::new("raw-emails/a", 1, TagSet::new(), Utc::now());
        assert_eq!(engine.evaluate(&meta).unwrap().rule_id, "first");
    }

    #[test]
    fn sweep_prefixes_drop_nested() {
        let engine = RetentionEngine::new(vec![
            RetentionRule::new("a", "raw-emails/", days(1)),
            RetentionRule::new("b", "raw-emails/", days(2)),
            RetentionRule::new("c", "raw-emails/old/", days(3)),
            RetentionRule::new("d", "tmp/", days(4)),
        ]);
        assert_eq!(engine.sweep_prefixes(), vec!["tmp/", "raw-emails/"]);
    }

    #[tokio::test]
    async fn sweep_deletes_only_expired() {
        let bucket = Bucket::new("b", Arc::new(MemoryBackend::new()), engine());
        bucket.put("raw-emails/keep", b"1".to_vec(), TagSet::new()).await.unwrap();
        bucket.put("raw-emails/done", b"2".to_vec(), TagSet::new()).await.unwrap();
        bucket.put("receipts/kept", b"3".to_vec(), TagSet::new()).await.unwrap();
        bucket.tag("raw-emails/done", processed()).await.unwrap();

        let sweeper = RetentionSweeper::new(Arc::clone(&bucket));

        let report = sweeper.sweep(Utc::now() + days(1)).await.unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.scanned, 2);

        let report = sweeper.sweep(Utc::now() + days(8)).await.unwrap();
        assert_eq!(report.deleted, vec!["raw-emails/done".to_string()]);
        assert!(bucket.head("raw-emails/keep").await.is_ok());

        let report = sweeper.sweep(Utc::now() + days(31)).await.unwrap();
        assert_eq!(report.deleted, vec!["raw-emails/keep".to_string()]);
        assert!(bucket.head("receipts/kept").await.is_ok());
    }
}
