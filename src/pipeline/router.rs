//! Recipient-matched routing rules with ordered, short-circuiting action chains.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::access::Principal;
use crate::config::IntakeConfig;
use crate::error::RouteError;
use crate::invoker::ProcessorInvoker;
use crate::pipeline::actions::{Action, ActionContext, InvokeAction, StoreAction};
use crate::pipeline::types::{ActionResult, ActionStatus, Envelope, RouteOutcome};
use crate::store::BucketHandle;

/// Recipients plus the actions run, in order, for mail sent to them.
///
/// Recipient addresses compare case-insensitively, ignoring surrounding
/// whitespace: both the local part and the domain are folded to lowercase.
pub struct RoutingRule {
    pub name: String,
    recipients: Vec<String>,
    actions: Vec<Arc<dyn Action>>,
}

impl RoutingRule {
    pub fn new(name: impl Into<String>, recipients: &[String], actions: Vec<Arc<dyn Action>>) -> Self {
        Self {
            name: name.into(),
            recipients: recipients.iter().map(|r| r.trim().to_lowercase()).collect(),
            actions,
        }
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Exact address match after trimming and lowercasing. No plus-addressing
    /// or wildcard forms.
    pub fn matches(&self, recipient: &str) -> bool {
        let recipient = recipient.trim().to_lowercase();
        self.recipients.iter().any(|r| *r == recipient)
    }
}

/// Routes envelopes to the first rule matching their recipient.
pub struct IngestionRouter {
    rules: Vec<RoutingRule>,
}

impl IngestionRouter {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        Self { rules }
    }

    /// The receipt rule: `receipts@<domain>` runs store then invoke.
    ///
    /// `bucket` must be bound to the ingestion router principal.
    pub fn receipts(config: &IntakeConfig, bucket: BucketHandle, invoker: Arc<ProcessorInvoker>) -> Self {
        let actions: Vec<Arc<dyn Action>> = vec![
            Arc::new(StoreAction::new(bucket, config.raw_prefix.clone())),
            Arc::new(InvokeAction::new(invoker, Principal::IngestionRouter)),
        ];
        Self::new(vec![RoutingRule::new(
            "receipts",
            &[config.recipient()],
            actions,
        )])
    }

    pub fn accepts(&self, recipient: &str) -> bool {
        self.rules.iter().any(|r| r.matches(recipient))
    }

    pub fn recipients(&self) -> Vec<String> {
        self.rules
            .iter()
            .flat_map(|r| r.recipients().iter().cloned())
            .collect()
    }

    /// Run the matching rule's actions left to right, stopping at the first failure.
    ///
    /// Later actions are reported as skipped. Earlier side effects (a stored
    /// artifact) are never undone.
    pub async fn route(&self, envelope: &Envelope) -> Result<RouteOutcome, RouteError> {
        let rule = self
            .rules
            .iter()
            .find(|r| r.matches(&envelope.recipient))
            .ok_or_else(|| RouteError::NoMatchingRule {
                recipient: envelope.recipient.clone(),
            })?;

        let mut ctx = ActionContext::new(envelope);
        let mut results = Vec::with_capacity(rule.actions.len());
        let mut halted = false;

        for action in &rule.actions {
            if halted {
                results.push(ActionResult {
                    action: action.name(),
                    status: ActionStatus::Skipped,
                });
                continue;
            }

            let status = match action.execute(&mut ctx).await {
                Ok(output) => ActionStatus::Completed(output),
                Err(e) => {
                    if ctx.artifact.is_some() {
                        warn!(
                            rule = %rule.name,
                            message_id = %envelope.message_id,
                            action = action.name(),
                            error = %e,
                            "Action failed after store; artifact kept for reprocessing"
                        );
                    } else {
                        error!(
                            rule = %rule.name,
                            message_id = %envelope.message_id,
                            action = action.name(),
                            error = %e,
                            "Action failed"
                        );
                    }
                    halted = true;
                    ActionStatus::Failed(e)
                }
            };
            results.push(ActionResult {
                action: action.name(),
                status,
            });
        }

        info!(
            rule = %rule.name,
            message_id = %envelope.message_id,
            succeeded = !halted,
            "Message routed"
        );

        Ok(RouteOutcome {
            rule: rule.name.clone(),
            message_id: envelope.message_id.clone(),
            results,
        })
    }
}
