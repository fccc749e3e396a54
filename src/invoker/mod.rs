//! Concurrency-limited processor invocation.
//!
//! A [`ProcessorInvoker`] gates every dispatch on a semaphore sized to the
//! configured concurrency. What happens to a dispatch that finds no free slot
//! is an explicit [`AdmissionPolicy`]: reject immediately with a retryable
//! `ConcurrencyExhausted`, or wait up to a bound and then reject. Nothing is
//! ever silently dropped.
//!
//! Each admitted invocation runs under a hard timeout. A timed-out invocation
//! is cancelled and never tagged. On a `Processed` report the artifact is
//! tagged `status=processed`, which moves it onto the short retention rule.

pub mod ledger;
pub mod processor;
pub mod receipt;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::access::{AccessPolicy, Permission, Principal, Resource};
use crate::config::{InvokerConfig, PROCESSED, STATUS_TAG};
use crate::cost::UsageMeter;
use crate::error::InvokeError;
use crate::store::{ArtifactRef, TagSet};

pub use processor::{
    DeclineReason, Disposition, InvocationContext, ProcessReport, Processor, ProcessorResources,
};
pub use ledger::{LedgerEntry, ReceiptLedger};
pub use receipt::{
    Attachment, Category, ManifestExtractor, ReceiptExtractor, ReceiptItem, ReceiptProcessor,
    ReceiptRequest,
};

/// Suggested backoff when a dispatch is rejected outright.
const REJECT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// What to do with a dispatch when every slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// Wait for a slot for at most `max_wait`, then reject.
    Queue { max_wait: Duration },
    /// Reject immediately.
    Reject,
}

/// Result of a completed invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationOutcome {
    pub invocation_id: Uuid,
    pub artifact: ArtifactRef,
    pub report: ProcessReport,
    /// Whether the artifact was tagged as processed.
    pub tagged: bool,
    pub duration_ms: u64,
}

/// Invocation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvokerStats {
    pub active: usize,
    pub peak: usize,
    pub completed: u64,
    pub failed: u64,
    pub throttled: u64,
    pub timed_out: u64,
}

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    throttled: AtomicU64,
    timed_out: AtomicU64,
}

/// Decrements the active count when an invocation ends, cancelled or not.
struct ActiveGuard<'a> {
    counters: &'a Counters,
    _permit: OwnedSemaphorePermit,
}

impl<'a> ActiveGuard<'a> {
    fn enter(counters: &'a Counters, permit: OwnedSemaphorePermit) -> Self {
        let now_active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak.fetch_max(now_active, Ordering::SeqCst);
        Self {
            counters,
            _permit: permit,
        }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Dispatches stored artifacts to a [`Processor`] under fixed limits.
pub struct ProcessorInvoker {
    function_name: String,
    limits: InvokerConfig,
    semaphore: Arc<Semaphore>,
    processor: Arc<dyn Processor>,
    resources: ProcessorResources,
    policy: Arc<AccessPolicy>,
    meter: Option<Arc<UsageMeter>>,
    counters: Counters,
}

impl ProcessorInvoker {
    pub fn new(
        function_name: impl Into<String>,
        limits: InvokerConfig,
        processor: Arc<dyn Processor>,
        resources: ProcessorResources,
        policy: Arc<AccessPolicy>,
    ) -> Self {
        let function_name = function_name.into();
        info!(
            function = %function_name,
            concurrency = limits.concurrency,
            timeout_secs = limits.timeout.as_secs(),
            memory_mb = limits.memory_mb,
            admission = ?limits.admission,
            "Processor invoker ready"
        );
        Self {
            function_name,
            semaphore: Arc::new(Semaphore::new(limits.concurrency)),
            limits,
            processor,
            resources,
            policy,
            meter: None,
            counters: Counters::default(),
        }
    }

    /// Meter every invocation's duration and memory for cost tracking.
    pub fn with_meter(mut self, meter: Arc<UsageMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn limits(&self) -> &InvokerConfig {
        &self.limits
    }

    pub fn stats(&self) -> InvokerStats {
        InvokerStats {
            active: self.counters.active.load(Ordering::SeqCst),
            peak: self.counters.peak.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            throttled: self.counters.throttled.load(Ordering::SeqCst),
            timed_out: self.counters.timed_out.load(Ordering::SeqCst),
        }
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, InvokeError> {
        let exhausted = |retry_after| InvokeError::ConcurrencyExhausted {
            limit: self.limits.concurrency,
            retry_after,
        };

        let permit = match self.limits.admission {
            AdmissionPolicy::Reject => match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                    Err(exhausted(REJECT_RETRY_AFTER))
                }
            },
            AdmissionPolicy::Queue { max_wait } => {
                match tokio::time::timeout(max_wait, Arc::clone(&self.semaphore).acquire_owned()).await {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_closed)) => Err(exhausted(max_wait)),
                    Err(_elapsed) => Err(exhausted(max_wait)),
                }
            }
        };

        if permit.is_err() {
            self.counters.throttled.fetch_add(1, Ordering::SeqCst);
        }
        permit
    }

    /// Run the processor for `artifact` on behalf of `caller`.
    ///
    /// Blocks until the invocation completes, fails or times out.
    pub async fn dispatch(
        &self,
        caller: Principal,
        artifact: &ArtifactRef,
    ) -> Result<InvocationOutcome, InvokeError> {
        self.policy.authorize(
            caller,
            Permission::FunctionInvoke,
            &Resource::Function(&self.function_name),
        )?;

        let permit = match self.admit().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(
                    function = %self.function_name,
                    key = %artifact.key,
                    limit = self.limits.concurrency,
                    "Invocation throttled"
                );
                return Err(e);
            }
        };
        let _active = ActiveGuard::enter(&self.counters, permit);

        let invocation_id = Uuid::new_v4();
        let ctx = InvocationContext::new(invocation_id, artifact.clone(), &self.resources);
        debug!(
            function = %self.function_name,
            invocation_id = %invocation_id,
            key = %artifact.key,
            "Invocation started"
        );

        let started = Instant::now();
        let result = tokio::time::timeout(self.limits.timeout, self.processor.process(&ctx)).await;
        let elapsed = started.elapsed().min(self.limits.timeout);

        if let Some(ref meter) = self.meter {
            meter.record(elapsed, self.limits.memory_mb, Utc::now()).await;
        }

        let report = match result {
            Err(_elapsed) => {
                self.counters.timed_out.fetch_add(1, Ordering::SeqCst);
                warn!(
                    function = %self.function_name,
                    invocation_id = %invocation_id,
                    key = %artifact.key,
                    timeout_secs = self.limits.timeout.as_secs(),
                    "Invocation timed out"
                );
                return Err(InvokeError::Timeout {
                    key: artifact.key.clone(),
                    timeout: self.limits.timeout,
                });
            }
            Ok(Err(e)) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    function = %self.function_name,
                    invocation_id = %invocation_id,
                    key = %artifact.key,
                    error = %e,
                    "Invocation failed"
                );
                return Err(InvokeError::Failed {
                    key: artifact.key.clone(),
                    source: e,
                });
            }
            Ok(Ok(report)) => report,
        };

        let tagged = if report.is_processed() {
            let tags = TagSet::from([(STATUS_TAG.to_string(), PROCESSED.to_string())]);
            if let Err(e) = self.resources.bucket.tag(&artifact.key, tags).await {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(
                    invocation_id = %invocation_id,
                    key = %artifact.key,
                    error = %e,
                    "Failed to tag processed artifact"
                );
                return Err(InvokeError::TagFailed {
                    key: artifact.key.clone(),
                    source: e,
                });
            }
            true
        } else {
            false
        };

        self.counters.completed.fetch_add(1, Ordering::SeqCst);
        info!(
            function = %self.function_name,
            invocation_id = %invocation_id,
            key = %artifact.key,
            disposition = ?report.disposition,
            tagged,
            duration_ms = elapsed.as_millis() as u64,
            "Invocation completed"
        );

        Ok(InvocationOutcome {
            invocation_id,
            artifact: artifact.clone(),
            report,
            tagged,
            duration_ms: elapsed.as_millis() as u64,
        })
    }
}
