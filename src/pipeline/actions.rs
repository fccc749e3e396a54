//! Receipt rule actions: store the raw message, then invoke the processor.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::access::Principal;
use crate::error::ActionError;
use crate::invoker::ProcessorInvoker;
use crate::pipeline::types::{ActionOutput, Envelope};
use crate::store::{ArtifactRef, BucketHandle, TagSet};

/// State threaded through one action chain.
pub struct ActionContext<'a> {
    pub envelope: &'a Envelope,
    /// Set by the store action; read by later actions.
    pub artifact: Option<ArtifactRef>,
}

impl<'a> ActionContext<'a> {
    pub fn new(envelope: &'a Envelope) -> Self {
        Self {
            envelope,
            artifact: None,
        }
    }
}

/// One step of a routing rule.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, ActionError>;
}

/// Persist the raw message at `<prefix><message_id>`.
pub struct StoreAction {
    bucket: BucketHandle,
    prefix: String,
}

impl StoreAction {
    pub fn new(bucket: BucketHandle, prefix: impl Into<String>) -> Self {
        Self {
            bucket,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Action for StoreAction {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, ActionError> {
        let key = format!("{}{}", self.prefix, ctx.envelope.message_id);
        let artifact = self
            .bucket
            .put(&key, ctx.envelope.raw.clone(), TagSet::new())
            .await
            .map_err(ActionError::StoreWriteFailure)?;
        debug!(key = %artifact.key, size = artifact.size, "Raw message stored");
        ctx.artifact = Some(artifact.clone());
        Ok(ActionOutput::Stored(artifact))
    }
}

/// Dispatch the stored artifact to the processor and wait for it.
pub struct InvokeAction {
    invoker: Arc<ProcessorInvoker>,
    caller: Principal,
}

impl InvokeAction {
    pub fn new(invoker: Arc<ProcessorInvoker>, caller: Principal) -> Self {
        Self { invoker, caller }
    }
}

#[async_trait]
impl Action for InvokeAction {
    fn name(&self) -> &'static str {
        "invoke"
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>) -> Result<ActionOutput, ActionError> {
        let artifact = ctx
            .artifact
            .as_ref()
            .ok_or_else(|| ActionError::MissingArtifact {
                action: self.name().into(),
            })?;
        let outcome = self.invoker.dispatch(self.caller, artifact).await?;
        Ok(ActionOutput::Invoked(Box::new(outcome)))
    }
}
