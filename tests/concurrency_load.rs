//! Load tests for the processor concurrency cap.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use receipt_intake::error::{ActionError, InvokeError, ProcessorError};
use receipt_intake::invoker::{AdmissionPolicy, InvocationContext, ProcessReport, Processor};
use receipt_intake::pipeline::{InboundMail, RouteOutcome};

use common::{RECIPIENT, Stack, StackBuilder};

/// Sleeps while holding a slot and records how many invocations overlap.
/// Keys containing `slow` sleep far longer.
struct Sleeper {
    delay: Duration,
    slow_delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Sleeper {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            slow_delay: Duration::from_secs(10),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Processor for Sleeper {
    async fn process(&self, ctx: &InvocationContext) -> Result<ProcessReport, ProcessorError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = if ctx.artifact.key.contains("slow") {
            self.slow_delay
        } else {
            self.delay
        };
        tokio::time::sleep(delay).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(ProcessReport::processed("slept"))
    }
}

async fn stack_with(sleeper: Arc<Sleeper>, admission: AdmissionPolicy) -> Stack {
    StackBuilder::new()
        .config(|c| c.invoker.admission = admission)
        .processor(sleeper)
        .build()
        .await
}

async fn burst(stack: &Stack, ids: Vec<String>) -> Vec<RouteOutcome> {
    let handles = ids.into_iter().map(|id| {
        let relay = Arc::clone(&stack.relay);
        tokio::spawn(async move {
            relay
                .accept(InboundMail {
                    recipient: RECIPIENT.to_string(),
                    raw: format!("From: alice@example.com\r\nSubject: {id}\r\n\r\nbody").into_bytes(),
                    relay_message_id: Some(id),
                })
                .await
                .unwrap()
        })
    });
    join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
}

fn ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}-{i}")).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reject_admission_caps_at_two_and_throttles_the_rest() {
    let sleeper = Sleeper::new(Duration::from_millis(300));
    let stack = stack_with(Arc::clone(&sleeper), AdmissionPolicy::Reject).await;

    let outcomes = burst(&stack, ids("burst", 8)).await;

    let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
    assert_eq!(succeeded, 2);

    for outcome in outcomes.iter().filter(|o| !o.succeeded()) {
        // Throttled messages are still stored.
        assert!(outcome.artifact().is_some());
        match outcome.failure() {
            Some(("invoke", ActionError::Invoke(e))) => {
                assert!(e.is_retryable());
                assert!(matches!(e, InvokeError::ConcurrencyExhausted { limit: 2, .. }));
                assert!(e.retry_after().is_some());
            }
            other => panic!("expected throttled invoke, got {other:?}"),
        }
    }

    assert!(sleeper.peak.load(Ordering::SeqCst) <= 2);
    let stats = stack.invoker.stats();
    assert!(stats.peak <= 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.throttled, 6);
    assert_eq!(stats.active, 0);
    assert_eq!(stack.bucket.list("raw-emails/").await.unwrap().len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queue_admission_runs_everything_two_at_a_time() {
    let sleeper = Sleeper::new(Duration::from_millis(50));
    let stack = stack_with(
        Arc::clone(&sleeper),
        AdmissionPolicy::Queue {
            max_wait: Duration::from_secs(10),
        },
    )
    .await;

    let outcomes = burst(&stack, ids("queued", 10)).await;

    assert!(outcomes.iter().all(|o| o.succeeded()));
    assert!(outcomes.iter().all(|o| o.invocation().unwrap().tagged));
    assert_eq!(sleeper.peak.load(Ordering::SeqCst), 2);

    let stats = stack.invoker.stats();
    assert_eq!(stats.peak, 2);
    assert_eq!(stats.completed, 10);
    assert_eq!(stats.throttled, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_invocations_release_their_slots() {
    let sleeper = Sleeper::new(Duration::from_millis(10));
    let stack = StackBuilder::new()
        .config(|c| c.invoker.timeout = Duration::from_millis(100))
        .processor(Arc::clone(&sleeper) as Arc<dyn Processor>)
        .build()
        .await;

    let slow = burst(&stack, ids("slow", 2)).await;
    for outcome in &slow {
        assert!(matches!(
            outcome.failure(),
            Some(("invoke", ActionError::Invoke(InvokeError::Timeout { .. })))
        ));
    }
    assert_eq!(stack.invoker.stats().timed_out, 2);
    assert_eq!(stack.invoker.stats().active, 0);

    let fast = burst(&stack, ids("fast", 2)).await;
    assert!(fast.iter().all(|o| o.succeeded()));
}
