//! Receipt ledger.
//!
//! Every archived line item gets one [`LedgerEntry`], written as its own
//! immutable JSON object under [`LEDGER_PREFIX`]. There is no shared ledger
//! file to rewrite, so concurrent invocations never race on a single object.
//! The spreadsheet view is rendered on demand by [`render_csv`].
//!
//! Each new entry is scored against the existing ones for how likely it is a
//! resubmission of a receipt already on file.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::receipt::Category;
use crate::error::StoreError;
use crate::store::{ArtifactRef, BucketHandle, TagSet};

/// Prefix ledger entries are stored under.
pub const LEDGER_PREFIX: &str = "ledger/";

/// Column headers of the rendered ledger.
pub const LEDGER_HEADERS: [&str; 10] = [
    "Service Date",
    "Payment Date",
    "Vendor/Provider",
    "Category",
    "Description",
    "Amount",
    "Receipt URI",
    "Reimbursed",
    "Notes",
    "Prob. of Duplicate",
];

/// One archived line item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub service_date: Option<NaiveDate>,
    pub payment_date: Option<NaiveDate>,
    pub provider: String,
    pub category: Category,
    pub description: String,
    /// Missing only for force-stored items the extractor could not price.
    pub amount: Option<Decimal>,
    /// `<bucket>/<key>` of the archived attachment.
    pub receipt_uri: String,
    #[serde(default)]
    pub reimbursed: bool,
    #[serde(default)]
    pub notes: String,
    /// 0-100, computed against the entries on file when this one was recorded.
    #[serde(default)]
    pub duplicate_score: u8,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn receipt_uri(artifact: &ArtifactRef) -> String {
        format!("{}/{}", artifact.bucket, artifact.key)
    }
}

/// How likely `candidate` duplicates something in `existing`, 0-100.
///
/// Per existing entry: same provider (case-insensitive) +30, same amount
/// (within a cent) +30, same service date +40 or within 30 days +20. The best
/// match wins.
pub fn duplicate_score(existing: &[LedgerEntry], candidate: &LedgerEntry) -> u8 {
    let provider = candidate.provider.trim().to_lowercase();

    existing
        .iter()
        .map(|entry| {
            let mut score = 0u8;

            if !provider.is_empty() && entry.provider.trim().to_lowercase() == provider {
                score += 30;
            }

            if let (Some(a), Some(b)) = (entry.amount, candidate.amount) {
                if (a - b).abs() < dec!(0.01) {
                    score += 30;
                }
            }

            if let (Some(a), Some(b)) = (entry.service_date, candidate.service_date) {
                let days = (a - b).num_days().abs();
                if days == 0 {
                    score += 40;
                } else if days <= 30 {
                    score += 20;
                }
            }

            score
        })
        .max()
        .unwrap_or(0)
}

/// Ledger stored in the artifact bucket.
#[derive(Clone)]
pub struct ReceiptLedger {
    bucket: BucketHandle,
}

impl ReceiptLedger {
    pub fn new(bucket: BucketHandle) -> Self {
        Self { bucket }
    }

    /// Every readable entry, oldest first. Entries that fail to parse are skipped.
    pub async fn entries(&self) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut entries = Vec::new();
        for meta in self.bucket.list(LEDGER_PREFIX).await? {
            let body = self.bucket.get(&meta.key).await?;
            match serde_json::from_slice::<LedgerEntry>(&body) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(key = %meta.key, error = %e, "Skipping unreadable ledger entry"),
            }
        }
        entries.sort_by_key(|e| e.recorded_at);
        Ok(entries)
    }

    /// Record `entry` under `key`, scoring it against the entries on file.
    ///
    /// If an entry already exists at `key` (a reprocessed message) it is
    /// returned unchanged.
    pub async fn record(&self, key: &str, mut entry: LedgerEntry) -> Result<LedgerEntry, StoreError> {
        match self.bucket.get(key).await {
            Ok(body) => {
                if let Ok(existing) = serde_json::from_slice::<LedgerEntry>(&body) {
                    debug!(key = %key, "Ledger entry already recorded");
                    return Ok(existing);
                }
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        entry.duplicate_score = duplicate_score(&self.entries().await?, &entry);
        let body = serde_json::to_vec_pretty(&entry).map_err(|e| StoreError::WriteFailure {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.bucket.put(key, body, TagSet::new()).await?;
        Ok(entry)
    }

    /// The whole ledger as CSV.
    pub async fn to_csv(&self) -> Result<String, StoreError> {
        Ok(render_csv(&self.entries().await?))
    }
}

/// Key for the ledger entry of item `item` in attachment `attachment` of message `message_id`.
pub fn entry_key(message_id: &str, attachment: usize, item: usize) -> String {
    format!("{LEDGER_PREFIX}{message_id}/{attachment}-{item}.json")
}

/// Render entries as CSV with a header row.
pub fn render_csv(entries: &[LedgerEntry]) -> String {
    let mut out = String::new();
    push_row(&mut out, LEDGER_HEADERS.iter().map(|h| h.to_string()));

    for entry in entries {
        let date = |d: Option<NaiveDate>| d.map(|d| d.to_string()).unwrap_or_default();
        push_row(
            &mut out,
            [
                date(entry.service_date),
                date(entry.payment_date),
                entry.provider.clone(),
                entry.category.to_string(),
                entry.description.clone(),
                entry
                    .amount
                    .map(|a| format!("{:.2}", a.round_dp(2)))
                    .unwrap_or_default(),
                entry.receipt_uri.clone(),
                if entry.reimbursed { "Yes" } else { "No" }.to_string(),
                entry.notes.clone(),
                if entry.duplicate_score > 0 {
                    entry.duplicate_score.to_string()
                } else {
                    String::new()
                },
            ]
            .into_iter(),
        );
    }
    out
}

fn push_row(out: &mut String, fields: impl Iterator<Item = String>) {
    let fields: Vec<String> = fields.map(|f| escape_field(&f)).collect();
    out.push_str(&fields.join(","));
    out.push_str("\r\n");
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
