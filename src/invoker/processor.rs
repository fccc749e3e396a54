//! The processing collaborator seam.
//!
//! A [`Processor`] receives an [`InvocationContext`]: the artifact reference,
//! the processing-boundary environment and handles scoped to the processor
//! principal. It reports whether the message was processed or declined; only
//! `Processed` leads to the artifact being tagged.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::config::ProcessorEnv;
use crate::error::ProcessorError;
use crate::notify::MailerHandle;
use crate::params::ScopedParameters;
use crate::store::{ArtifactRef, BucketHandle};

/// Everything one invocation may touch.
#[derive(Clone)]
pub struct ProcessorResources {
    pub env: ProcessorEnv,
    pub params: ScopedParameters,
    pub bucket: BucketHandle,
    pub mailer: MailerHandle,
}

/// Per-invocation input handed to a [`Processor`].
#[derive(Clone)]
pub struct InvocationContext {
    pub invocation_id: Uuid,
    pub artifact: ArtifactRef,
    pub env: ProcessorEnv,
    pub params: ScopedParameters,
    pub bucket: BucketHandle,
    pub mailer: MailerHandle,
}

impl InvocationContext {
    pub fn new(invocation_id: Uuid, artifact: ArtifactRef, resources: &ProcessorResources) -> Self {
        Self {
            invocation_id,
            artifact,
            env: resources.env.clone(),
            params: resources.params.clone(),
            bucket: resources.bucket.clone(),
            mailer: resources.mailer.clone(),
        }
    }
}

/// Why a processor declined a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeclineReason {
    UnauthorizedSender { sender: String },
    NoAttachments,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    Processed,
    Declined(DeclineReason),
}

/// What a processor did with one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    #[serde(flatten)]
    pub disposition: Disposition,
    pub summary: Option<String>,
}

impl ProcessReport {
    pub fn processed(summary: impl Into<String>) -> Self {
        Self {
            disposition: Disposition::Processed,
            summary: Some(summary.into()),
        }
    }

    pub fn declined(reason: DeclineReason) -> Self {
        Self {
            disposition: Disposition::Declined(reason),
            summary: None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.disposition == Disposition::Processed
    }
}

/// Handles one stored message.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: &InvocationContext) -> Result<ProcessReport, ProcessorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serializes_flat() {
        let json = serde_json::to_value(ProcessReport::declined(DeclineReason::UnauthorizedSender {
            sender: "intruder@evil.com".into(),
        }))
        .unwrap();
        assert_eq!(json["disposition"], "declined");
        assert_eq!(json["reason"], "unauthorized_sender");
        assert_eq!(json["sender"], "intruder@evil.com");

        let json = serde_json::to_value(ProcessReport::processed("1 receipt")).unwrap();
        assert_eq!(json["disposition"], "processed");
        assert_eq!(json["summary"], "1 receipt");
    }
}
