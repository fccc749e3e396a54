use std::sync::Arc;

use anyhow::Context;
use receipt_intake::access::{AccessPolicy, Principal};
use receipt_intake::config::IntakeConfig;
use receipt_intake::cost::{
    self, AlertLedger, CostMonitor, CostSource, MemoryLedger, UsageMeter, UsageStore,
};
use receipt_intake::invoker::{
    ManifestExtractor, ProcessorInvoker, ProcessorResources, ReceiptLedger, ReceiptProcessor,
};
use receipt_intake::notify::{BroadcastTopic, Mailer, MailerHandle, Outbox, SmtpConfig, SmtpMailer, TopicHandle};
use receipt_intake::params::{EnvParameters, ScopedParameters};
use receipt_intake::pipeline::{IngestionRouter, MailRelay};
use receipt_intake::server::intake_routes;
use receipt_intake::store::retention::spawn_retention_sweep;
use receipt_intake::store::{
    Bucket, LibSqlBackend, MemoryBackend, ObjectBackend, RetentionEngine, RetentionSweeper,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = IntakeConfig::from_env()?;

    eprintln!("Receipt intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Recipient: {}", config.recipient());
    eprintln!("   Bucket: {}", config.bucket_name);
    eprintln!(
        "   Processor: {} (concurrency {}, timeout {}s)",
        config.function_name(),
        config.invoker.concurrency,
        config.invoker.timeout.as_secs()
    );

    // ── Storage ─────────────────────────────────────────────────────────
    let (backend, ledger, usage): (
        Arc<dyn ObjectBackend>,
        Arc<dyn AlertLedger>,
        Option<Arc<dyn UsageStore>>,
    ) = match &config.db_path {
        Some(path) => {
            let db = Arc::new(
                LibSqlBackend::new_local(path)
                    .await
                    .with_context(|| format!("Failed to open database at {}", path.display()))?,
            );
            eprintln!("   Database: {}", path.display());
            (db.clone(), db.clone(), Some(db))
        }
        None => {
            eprintln!("   Database: in-memory (set INTAKE_DB_PATH to persist)");
            (Arc::new(MemoryBackend::new()), Arc::new(MemoryLedger::new()), None)
        }
    };

    let policy = Arc::new(AccessPolicy::least_privilege(&config));
    let bucket = Bucket::new(
        config.bucket_name.clone(),
        backend,
        RetentionEngine::new(config.retention_rules()),
    );

    // ── Processor ───────────────────────────────────────────────────────
    let mailer: Arc<dyn Mailer> = match SmtpConfig::from_env() {
        Some(smtp) => {
            eprintln!("   SMTP: {}:{}", smtp.host, smtp.port);
            Arc::new(SmtpMailer::new(smtp))
        }
        None => {
            eprintln!("   SMTP: disabled, replies kept in outbox");
            Arc::new(Outbox::new())
        }
    };

    let resources = ProcessorResources {
        env: config.processor_env(),
        params: ScopedParameters::new(
            Arc::new(EnvParameters),
            Arc::clone(&policy),
            Principal::Processor,
        ),
        bucket: bucket.handle(Arc::clone(&policy), Principal::Processor),
        mailer: MailerHandle::new(mailer, Arc::clone(&policy), Principal::Processor),
    };

    let meter = UsageMeter::new(config.pricing.clone());
    let meter = Arc::new(match usage {
        Some(store) => meter.with_store(store),
        None => meter,
    });
    let invoker = Arc::new(
        ProcessorInvoker::new(
            config.function_name(),
            config.invoker.clone(),
            Arc::new(ReceiptProcessor::new(Arc::new(ManifestExtractor))),
            resources,
            Arc::clone(&policy),
        )
        .with_meter(Arc::clone(&meter)),
    );

    // ── Routing ─────────────────────────────────────────────────────────
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

    // ── Background tasks ────────────────────────────────────────────────
    let _sweep_handle = spawn_retention_sweep(
        Arc::new(RetentionSweeper::new(Arc::clone(&bucket))),
        config.retention.sweep_interval,
    );

    let topic = BroadcastTopic::new(config.budget_topic_name());
    let mut alerts = topic.subscribe();
    tokio::spawn(async move {
        loop {
            match alerts.recv().await {
                Ok(message) => {
                    tracing::warn!(subject = %message.subject, body = %message.body, "Budget alert");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Budget alert log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let monitor = Arc::new(
        CostMonitor::new(
            config.budget_name(),
            &config.budget,
            TopicHandle::new(topic, Arc::clone(&policy), Principal::BudgetService),
        )
        .with_ledger(ledger),
    );
    let source: Arc<dyn CostSource> = meter;
    let _cost_handle = cost::spawn_cost_check(source, monitor, &config.budget.check_schedule)?;
    eprintln!(
        "   Budget: {} {} (checked on \"{}\")",
        config.budget.limit, config.budget.currency, config.budget.check_schedule
    );

    // ── HTTP ────────────────────────────────────────────────────────────
    let ledger = ReceiptLedger::new(bucket.handle(Arc::clone(&policy), Principal::IngestionRouter));
    let app = intake_routes(relay, invoker, ledger, config.max_message_bytes);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "Intake server started");
    eprintln!("   Inbound: http://0.0.0.0:{}/inbound\n", config.http_port);
    axum::serve(listener, app).await?;

    Ok(())
}
