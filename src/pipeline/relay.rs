//! Mail relay: the inbound boundary in front of the router.
//!
//! The relay owns the receipt rule set. Mail for a recipient no rule accepts
//! is rejected here, before anything is stored or invoked. Accepted mail gets
//! a relay message id (caller-supplied or generated) that becomes the
//! artifact key under the raw email prefix.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::Principal;
use crate::error::{Error, RouteError};
use crate::invoker::{InvocationOutcome, ProcessorInvoker};
use crate::pipeline::router::IngestionRouter;
use crate::pipeline::types::{Envelope, RouteOutcome};
use crate::store::BucketHandle;

/// Relay ids become object key segments.
static MESSAGE_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").unwrap());

/// Mail as handed over by the upstream relay.
#[derive(Debug, Clone)]
pub struct InboundMail {
    pub recipient: String,
    pub raw: Vec<u8>,
    pub relay_message_id: Option<String>,
}

pub struct MailRelay {
    router: Arc<IngestionRouter>,
    bucket: BucketHandle,
    invoker: Arc<ProcessorInvoker>,
    raw_prefix: String,
}

impl MailRelay {
    /// `bucket` must be bound to the ingestion router principal.
    pub fn new(
        router: Arc<IngestionRouter>,
        bucket: BucketHandle,
        invoker: Arc<ProcessorInvoker>,
        raw_prefix: impl Into<String>,
    ) -> Self {
        Self {
            router,
            bucket,
            invoker,
            raw_prefix: raw_prefix.into(),
        }
    }

    pub fn router(&self) -> &IngestionRouter {
        &self.router
    }

    /// Accept one message and route it.
    pub async fn accept(&self, mail: InboundMail) -> Result<RouteOutcome, RouteError> {
        let recipient = mail.recipient.trim().to_lowercase();
        if !self.router.accepts(&recipient) {
            warn!(recipient = %recipient, "Rejecting mail for unknown recipient");
            return Err(RouteError::NoMatchingRule { recipient });
        }

        let message_id = match mail.relay_message_id {
            Some(id) => validate_message_id(id.trim())?.to_string(),
            None => Uuid::new_v4().simple().to_string(),
        };

        info!(
            recipient = %recipient,
            message_id = %message_id,
            size = mail.raw.len(),
            "Mail accepted"
        );

        let envelope = Envelope {
            recipient,
            message_id,
            raw: mail.raw,
        };
        self.router.route(&envelope).await
    }

    /// Re-dispatch an already stored message, for manual reprocessing.
    pub async fn reprocess(&self, message_id: &str) -> Result<InvocationOutcome, Error> {
        let message_id = validate_message_id(message_id)?;
        let key = format!("{}{}", self.raw_prefix, message_id);
        let artifact = self.bucket.head(&key).await?.to_ref(self.bucket.name());

        info!(key = %key, "Reprocessing stored message");
        Ok(self
            .invoker
            .dispatch(Principal::IngestionRouter, &artifact)
            .await?)
    }
}

fn validate_message_id(id: &str) -> Result<&str, RouteError> {
    if MESSAGE_ID_PATTERN.is_match(id) {
        Ok(id)
    } else {
        Err(RouteError::InvalidMessageId { id: id.to_string() })
    }
}
