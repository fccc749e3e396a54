//! Shared wiring for integration tests: the full intake stack over in-memory
//! collaborators.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use secrecy::SecretString;

use receipt_intake::access::{AccessPolicy, Principal};
use receipt_intake::config::IntakeConfig;
use receipt_intake::error::ProcessorError;
use receipt_intake::invoker::{
    Attachment, Category, Processor, ProcessorInvoker, ProcessorResources, ReceiptExtractor,
    ReceiptItem, ReceiptLedger, ReceiptProcessor, ReceiptRequest,
};
use receipt_intake::notify::{MailerHandle, Outbox};
use receipt_intake::params::{InMemoryParameters, ScopedParameters};
use receipt_intake::pipeline::{IngestionRouter, MailRelay};
use receipt_intake::store::{Bucket, MemoryBackend, ObjectBackend, RetentionEngine};

pub const RECIPIENT: &str = "receipts@hsa.example.com";

/// Finds one eligible pharmacy purchase in every attachment.
pub struct PharmacyExtractor;

pub fn pharmacy_item() -> ReceiptItem {
    ReceiptItem {
        eligible: true,
        description: "Prescription refill".into(),
        short_description: "Pharmacy".into(),
        category: Category::Pharmacy,
        amount: Some(Decimal::new(4250, 2)),
        provider: Some("Main Street Pharmacy".into()),
        service_date: NaiveDate::from_ymd_opt(2026, 3, 1),
        payment_date: NaiveDate::from_ymd_opt(2026, 3, 1),
        reasoning: "Prescription medication is eligible.".into(),
    }
}

#[async_trait]
impl ReceiptExtractor for PharmacyExtractor {
    async fn extract(
        &self,
        _request: &ReceiptRequest,
        _attachment: &Attachment,
        _api_key: &SecretString,
    ) -> Result<Vec<ReceiptItem>, ProcessorError> {
        Ok(vec![pharmacy_item()])
    }
}

pub struct Stack {
    pub config: IntakeConfig,
    pub bucket: Arc<Bucket>,
    pub params: Arc<InMemoryParameters>,
    pub outbox: Arc<Outbox>,
    pub invoker: Arc<ProcessorInvoker>,
    pub relay: Arc<MailRelay>,
    pub ledger: ReceiptLedger,
}

pub struct StackBuilder {
    config: IntakeConfig,
    backend: Arc<dyn ObjectBackend>,
    processor: Option<Arc<dyn Processor>>,
}

impl StackBuilder {
    pub fn new() -> Self {
        Self {
            config: IntakeConfig::default(),
            backend: Arc::new(MemoryBackend::new()),
            processor: None,
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut IntakeConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn ObjectBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub async fn build(self) -> Stack {
        let config = self.config;
        let policy = Arc::new(AccessPolicy::least_privilege(&config));
        let bucket = Bucket::new(
            config.bucket_name.clone(),
            self.backend,
            RetentionEngine::new(config.retention_rules()),
        );

        let params = Arc::new(InMemoryParameters::new());
        params.set(config.api_key_param(), "sk-test").await;
        params
            .set(config.allowed_senders_param(), "alice@example.com, @clinic.example.org")
            .await;

        let outbox = Arc::new(Outbox::new());
        let resources = ProcessorResources {
            env: config.processor_env(),
            params: ScopedParameters::new(params.clone(), Arc::clone(&policy), Principal::Processor),
            bucket: bucket.handle(Arc::clone(&policy), Principal::Processor),
            mailer: MailerHandle::new(outbox.clone(), Arc::clone(&policy), Principal::Processor),
        };

        let processor = self
            .processor
            .unwrap_or_else(|| Arc::new(ReceiptProcessor::new(Arc::new(PharmacyExtractor))));
        let invoker = Arc::new(ProcessorInvoker::new(
            config.function_name(),
            config.invoker.clone(),
            processor,
            resources,
            Arc::clone(&policy),
        ));

        let router_bucket = bucket.handle(Arc::clone(&policy), Principal::IngestionRouter);
        let router = Arc::new(IngestionRouter::receipts(
            &config,
            router_bucket.clone(),
            Arc::clone(&invoker),
        ));
        let relay = Arc::new(MailRelay::new(
            router,
            router_bucket,
            Arc::clone(&invoker),
            config.raw_prefix.clone(),
        ));

        let ledger = ReceiptLedger::new(bucket.handle(Arc::clone(&policy), Principal::IngestionRouter));

        Stack {
            config,
            bucket,
            params,
            outbox,
            invoker,
            relay,
            ledger,
        }
    }
}

/// A receipt email, optionally with one PDF attachment.
pub fn receipt_mime(from: &str, subject: &str, with_attachment: bool) -> Vec<u8> {
    let mut raw = format!(
        "From: {from}\r\nTo: {RECIPIENT}\r\nSubject: {subject}\r\nMessage-ID: <r1@mail.example.com>\r\nMIME-Version: 1.0\r\n"
    );
    if with_attachment {
        raw.push_str(
            "Content-Type: multipart/mixed; boundary=\"B\"\r\n\r\n\
             --B\r\nContent-Type: text/plain\r\n\r\nReceipt attached.\r\n\
             --B\r\nContent-Type: application/pdf\r\nContent-Disposition: attachment; filename=\"pharmacy.pdf\"\r\nContent-Transfer-Encoding: base64\r\n\r\nJVBERi0xLjQK\r\n\
             --B--\r\n",
        );
    } else {
        raw.push_str("Content-Type: text/plain\r\n\r\nForgot the file.\r\n");
    }
    raw.into_bytes()
}

/// A receipt email whose PDF attachment decodes to `lines * 57 + 9` bytes.
/// Each base64 line is 76 characters.
pub fn large_receipt_mime(from: &str, lines: usize) -> Vec<u8> {
    let mut raw = format!(
        "From: {from}\r\nTo: {RECIPIENT}\r\nSubject: Scanned statements\r\nMessage-ID: <big@mail.example.com>\r\nMIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"B\"\r\n\r\n\
         --B\r\nContent-Type: text/plain\r\n\r\nStatements attached.\r\n\
         --B\r\nContent-Type: application/pdf\r\nContent-Disposition: attachment; filename=\"statements.pdf\"\r\nContent-Transfer-Encoding: base64\r\n\r\nJVBERi0xLjQK\r\n"
    );
    let line = "QUFB".repeat(19);
    for _ in 0..lines {
        raw.push_str(&line);
        raw.push_str("\r\n");
    }
    raw.push_str("--B--\r\n");
    raw.into_bytes()
}
