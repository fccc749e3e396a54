//! Receipt processor: parse, gate on the sender allow-list, extract line items
//! per attachment, archive eligible ones onto the ledger, reply.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ledger::{LedgerEntry, ReceiptLedger, entry_key};
use super::processor::{DeclineReason, InvocationContext, ProcessReport, Processor};
use crate::error::ProcessorError;
use crate::notify::OutboundEmail;
use crate::store::{ArtifactRef, TagSet};

/// Subject prefix that archives a receipt regardless of the eligibility verdict.
pub const FORCE_STORE_PREFIX: &str = "FORCE_STORE";

/// Prefix archived attachments are written under.
pub const RECEIPTS_PREFIX: &str = "receipts/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A parsed receipt submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptRequest {
    pub sender: String,
    pub subject: String,
    pub message_id: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Subject carried the force-store prefix.
    pub forced: bool,
}

/// Expense category of a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Category {
    Medical,
    Dental,
    Vision,
    Pharmacy,
    #[default]
    #[serde(other)]
    Other,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Medical => "Medical",
            Self::Dental => "Dental",
            Self::Vision => "Vision",
            Self::Pharmacy => "Pharmacy",
            Self::Other => "Other",
        };
        f.write_str(s)
    }
}

/// One out-of-pocket transaction found in an attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptItem {
    pub eligible: bool,
    pub description: String,
    /// One or two words, used in filenames ("Pharmacy", "Tylenol").
    pub short_description: String,
    #[serde(default)]
    pub category: Category,
    pub amount: Option<Decimal>,
    pub provider: Option<String>,
    pub service_date: Option<NaiveDate>,
    pub payment_date: Option<NaiveDate>,
    pub reasoning: String,
}

impl ReceiptItem {
    /// Amount, provider and at least one date are known.
    pub fn is_complete(&self) -> bool {
        self.amount.is_some()
            && self.provider.is_some()
            && (self.service_date.is_some() || self.payment_date.is_some())
    }

    /// An incomplete item is never eligible, whatever the extractor said.
    pub fn validated(mut self) -> Self {
        if !self.is_complete() {
            self.eligible = false;
            self.reasoning.push_str(
                " Additionally, required fields (amount, provider, or date) could not be determined.",
            );
        }
        self
    }

    fn summary_line(&self) -> String {
        let amount = self
            .amount
            .map(|a| format!("${:.2}", a.round_dp(2)))
            .unwrap_or_else(|| "amount unknown".into());
        let provider = self.provider.as_deref().unwrap_or("unknown provider");
        format!("- {} ({}): {amount} at {provider}", self.description, self.category)
    }
}

/// Finds the line items in one attachment of a submission.
#[async_trait]
pub trait ReceiptExtractor: Send + Sync {
    async fn extract(
        &self,
        request: &ReceiptRequest,
        attachment: &Attachment,
        api_key: &SecretString,
    ) -> Result<Vec<ReceiptItem>, ProcessorError>;
}

/// Describes each attachment as a single item held for manual review.
///
/// Never calls out and never judges eligibility, so nothing is archived unless
/// the sender forces it.
#[derive(Debug, Default, Clone)]
pub struct ManifestExtractor;

#[async_trait]
impl ReceiptExtractor for ManifestExtractor {
    async fn extract(
        &self,
        _request: &ReceiptRequest,
        attachment: &Attachment,
        _api_key: &SecretString,
    ) -> Result<Vec<ReceiptItem>, ProcessorError> {
        let stem = attachment
            .filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&attachment.filename);
        Ok(vec![ReceiptItem {
            eligible: false,
            description: format!(
                "{} ({}, {} bytes)",
                attachment.filename,
                attachment.content_type,
                attachment.data.len()
            ),
            short_description: stem.to_string(),
            category: Category::Other,
            amount: None,
            provider: None,
            service_date: None,
            payment_date: None,
            reasoning: "No extraction backend is configured; held for manual review.".into(),
        }])
    }
}

/// Parse raw MIME into a [`ReceiptRequest`].
pub fn parse_request(raw: &[u8]) -> Result<ReceiptRequest, ProcessorError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ProcessorError::InvalidMessage("unparseable MIME".into()))?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .ok_or_else(|| ProcessorError::InvalidMessage("missing sender".into()))?;

    let subject = parsed.subject().unwrap_or_default().to_string();

    let attachments = parsed
        .attachments()
        .enumerate()
        .map(|(i, part)| {
            let content_type = MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".into());
            let filename = MimeHeaders::attachment_name(part)
                .map(sanitize_filename)
                .unwrap_or_else(|| format!("attachment-{}", i + 1));
            Attachment {
                filename,
                content_type,
                data: part.contents().to_vec(),
            }
        })
        .collect();

    Ok(ReceiptRequest {
        sender,
        forced: subject.trim_start().starts_with(FORCE_STORE_PREFIX),
        subject,
        message_id: parsed.message_id().map(|s| s.to_string()),
        attachments,
    })
}

/// Keep a filename safe to embed in an object key.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "attachment".into()
    } else {
        cleaned.to_string()
    }
}

/// An attachment with the items found in it.
struct Extracted<'a> {
    index: usize,
    attachment: &'a Attachment,
    items: Vec<ReceiptItem>,
}

impl Extracted<'_> {
    /// Items that go on the ledger.
    fn recorded(&self, forced: bool) -> impl Iterator<Item = (usize, &ReceiptItem)> {
        self.items
            .iter()
            .enumerate()
            .filter(move |(_, item)| forced || item.eligible)
    }
}

/// The reference processor for receipt emails.
pub struct ReceiptProcessor {
    extractor: Arc<dyn ReceiptExtractor>,
}

impl ReceiptProcessor {
    pub fn new(extractor: Arc<dyn ReceiptExtractor>) -> Self {
        Self { extractor }
    }

    /// Archive one attachment and put its items on the ledger.
    async fn archive(
        &self,
        ctx: &InvocationContext,
        ledger: &ReceiptLedger,
        message_id: &str,
        extracted: &Extracted<'_>,
        forced: bool,
    ) -> Result<(ArtifactRef, Vec<(ReceiptItem, LedgerEntry)>), ProcessorError> {
        let key = format!(
            "{RECEIPTS_PREFIX}{message_id}/{}-{}",
            extracted.index, extracted.attachment.filename
        );
        let tags = TagSet::from([("source".to_string(), ctx.artifact.key.clone())]);
        let artifact = ctx
            .bucket
            .put(&key, extracted.attachment.data.clone(), tags)
            .await?;

        let mut recorded = Vec::new();
        for (j, item) in extracted.recorded(forced) {
            let entry = LedgerEntry {
                service_date: item.service_date,
                payment_date: item.payment_date,
                provider: item.provider.clone().unwrap_or_default(),
                category: item.category,
                description: item.description.clone(),
                amount: item.amount,
                receipt_uri: LedgerEntry::receipt_uri(&artifact),
                reimbursed: false,
                notes: String::new(),
                duplicate_score: 0,
                recorded_at: Utc::now(),
            };
            let entry = ledger
                .record(&entry_key(message_id, extracted.index, j + 1), entry)
                .await?;
            recorded.push((item.clone(), entry));
        }
        Ok((artifact, recorded))
    }
}

#[async_trait]
impl Processor for ReceiptProcessor {
    async fn process(&self, ctx: &InvocationContext) -> Result<ProcessReport, ProcessorError> {
        let raw = ctx.bucket.get(&ctx.artifact.key).await?;
        let request = parse_request(&raw)?;

        let allowed = ctx
            .params
            .resolve_allow_list(&ctx.env.allowed_senders_param)
            .await?;
        if !allowed.permits(&request.sender) {
            warn!(
                invocation_id = %ctx.invocation_id,
                sender = %request.sender,
                "Sender not on allow-list, declining"
            );
            return Ok(ProcessReport::declined(DeclineReason::UnauthorizedSender {
                sender: request.sender,
            }));
        }

        if request.attachments.is_empty() {
            info!(invocation_id = %ctx.invocation_id, sender = %request.sender, "No attachments, declining");
            return Ok(ProcessReport::declined(DeclineReason::NoAttachments));
        }

        let api_key = ctx.params.resolve(&ctx.env.api_key_param).await?;
        let mut extracted = Vec::with_capacity(request.attachments.len());
        for (i, attachment) in request.attachments.iter().enumerate() {
            let items = self
                .extractor
                .extract(&request, attachment, &api_key)
                .await?
                .into_iter()
                .map(ReceiptItem::validated)
                .collect();
            extracted.push(Extracted {
                index: i + 1,
                attachment,
                items,
            });
        }

        let message_id = ctx
            .artifact
            .key
            .rsplit('/')
            .next()
            .unwrap_or(ctx.artifact.key.as_str());
        let ledger = ReceiptLedger::new(ctx.bucket.clone());

        let mut archived = Vec::new();
        let mut recorded = Vec::new();
        let mut rejected = Vec::new();
        for attachment in &extracted {
            if attachment.recorded(request.forced).next().is_some() {
                let (artifact, items) = self
                    .archive(ctx, &ledger, message_id, attachment, request.forced)
                    .await?;
                archived.push(artifact.key);
                recorded.extend(items);
            }
            rejected.extend(
                attachment
                    .items
                    .iter()
                    .filter(|item| !item.eligible && !request.forced),
            );
        }

        info!(
            invocation_id = %ctx.invocation_id,
            sender = %request.sender,
            archived = archived.len(),
            items = recorded.len(),
            rejected = rejected.len(),
            forced = request.forced,
            "Receipt processed"
        );

        let (subject, body) = if recorded.is_empty() {
            (
                format!("Receipt not archived: {}", request.subject),
                rejection_body(&rejected),
            )
        } else {
            (
                format!(
                    "Receipt archived ({} item{}): {}",
                    recorded.len(),
                    if recorded.len() == 1 { "" } else { "s" },
                    request.subject
                ),
                archived_body(&recorded, &archived, &rejected),
            )
        };

        ctx.mailer
            .send(&OutboundEmail {
                to: request.sender.clone(),
                subject,
                body,
                in_reply_to: request.message_id.clone(),
            })
            .await?;

        let summary = if recorded.is_empty() {
            "not eligible".to_string()
        } else {
            format!(
                "archived {} attachment(s), {} ledger item(s)",
                archived.len(),
                recorded.len()
            )
        };
        Ok(ProcessReport::processed(summary))
    }
}

/// Score at which a reply warns that the receipt may already be on file.
const DUPLICATE_WARNING_SCORE: u8 = 50;

fn archived_body(
    recorded: &[(ReceiptItem, LedgerEntry)],
    archived: &[String],
    rejected: &[&ReceiptItem],
) -> String {
    let mut body = String::from("Your receipt was archived.\n\n");
    for (item, entry) in recorded {
        body.push_str(&item.summary_line());
        body.push('\n');
        if entry.duplicate_score >= DUPLICATE_WARNING_SCORE {
            body.push_str(&format!(
                "  Possible duplicate: {}% match with a receipt already on file.\n",
                entry.duplicate_score
            ));
        }
    }
    body.push_str("\nStored as:\n");
    body.push_str(&archived.join("\n"));
    if !rejected.is_empty() {
        body.push_str("\n\nNot archived:\n");
        for item in rejected {
            body.push_str(&format!("{}\n  {}\n", item.summary_line(), item.reasoning.trim()));
        }
    }
    body
}

fn rejection_body(rejected: &[&ReceiptItem]) -> String {
    let mut body = String::from("This receipt does not look eligible.\n\n");
    if rejected.is_empty() {
        body.push_str("No transactions were found in the attachments.\n");
    }
    for item in rejected {
        body.push_str(&format!("{}\n  {}\n", item.summary_line(), item.reasoning.trim()));
    }
    body.push_str(&format!(
        "\nResend with a subject starting with {FORCE_STORE_PREFIX} to archive it anyway."
    ));
    body
}
