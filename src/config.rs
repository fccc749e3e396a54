//! Configuration types.
//!
//! Everything here is fixed at startup. Concurrency, timeout and memory limits
//! are not adjustable at runtime.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::ConfigError;
use crate::invoker::AdmissionPolicy;
use crate::store::retention::{RetentionRule, TagFilter};

/// Prefix every raw email is stored under.
pub const RAW_EMAIL_PREFIX: &str = "raw-emails/";

/// Tag key/value set on an artifact after successful processing.
pub const STATUS_TAG: &str = "status";
pub const PROCESSED: &str = "processed";

/// Largest inbound message the relay endpoint accepts, in bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 40 * 1024 * 1024;

/// Top-level intake configuration.
#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Application name; roots the parameter namespace and resource names.
    pub app_name: String,
    /// Mail domain the recipient lives on.
    pub domain_name: String,
    /// Local part of the single accepted recipient.
    pub recipient_local_part: String,
    /// Artifact bucket name.
    pub bucket_name: String,
    /// Prefix raw messages are stored under.
    pub raw_prefix: String,
    /// libSQL database path. `None` keeps artifacts in memory.
    pub db_path: Option<PathBuf>,
    /// Port for the inbound relay endpoint.
    pub http_port: u16,
    /// Request body limit for `/inbound`. Receipts arrive as base64 attachments,
    /// so this sits well above the framework default.
    pub max_message_bytes: usize,
    pub invoker: InvokerConfig,
    pub retention: RetentionConfig,
    pub budget: BudgetConfig,
    pub pricing: UsagePricing,
}

/// Processor invocation limits.
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Maximum simultaneously running invocations.
    pub concurrency: usize,
    /// Hard wall-clock timeout per invocation.
    pub timeout: Duration,
    /// Memory allotted per invocation (used for cost metering).
    pub memory_mb: u32,
    /// What happens to dispatches beyond the concurrency budget.
    pub admission: AdmissionPolicy,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            timeout: Duration::from_secs(300), // 5 minutes
            memory_mb: 1024,
            admission: AdmissionPolicy::Reject,
        }
    }
}

/// Tiered retention for raw emails.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Days a processed artifact is kept after tagging.
    pub processed_days: i64,
    /// Days any artifact is kept after creation.
    pub unprocessed_days: i64,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            processed_days: 7,
            unprocessed_days: 30,
            sweep_interval: Duration::from_secs(3600),
        }
    }
}

/// Monthly cost ceiling and alert thresholds.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    /// Absolute monthly limit.
    pub limit: Decimal,
    pub currency: String,
    /// Percent-of-limit checkpoints, ascending.
    pub thresholds: Vec<Decimal>,
    /// Cron expression (with seconds) for the periodic cost check.
    pub check_schedule: String,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit: dec!(10),
            currency: "USD".into(),
            thresholds: vec![dec!(50), dec!(80), dec!(100)],
            check_schedule: "0 0 * * * *".into(),
        }
    }
}

/// Prices used to turn metered invocation usage into cost.
#[derive(Debug, Clone)]
pub struct UsagePricing {
    pub per_gb_second: Decimal,
    pub per_request: Decimal,
}

impl Default for UsagePricing {
    fn default() -> Self {
        Self {
            per_gb_second: dec!(0.0000166667),
            per_request: dec!(0.0000002),
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            app_name: "hsa-receipt-archiver".into(),
            domain_name: "hsa.example.com".into(),
            recipient_local_part: "receipts".into(),
            bucket_name: "hsa-receipts".into(),
            raw_prefix: RAW_EMAIL_PREFIX.into(),
            db_path: None,
            http_port: 8080,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            invoker: InvokerConfig::default(),
            retention: RetentionConfig::default(),
            budget: BudgetConfig::default(),
            pricing: UsagePricing::default(),
        }
    }
}

impl IntakeConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from `INTAKE_*` keys resolved through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let app_name = env_or("INTAKE_APP_NAME", &defaults.app_name);
        let bucket_name =
            lookup("INTAKE_BUCKET_NAME").unwrap_or_else(|| format!("{app_name}-receipts"));

        let admission = match lookup("INTAKE_QUEUE_WAIT_SECS") {
            Some(raw) => AdmissionPolicy::Queue {
                max_wait: Duration::from_secs(parse_value("INTAKE_QUEUE_WAIT_SECS", &raw)?),
            },
            None => AdmissionPolicy::Reject,
        };

        let concurrency: usize =
            env_parse(&lookup, "INTAKE_CONCURRENCY", defaults.invoker.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INTAKE_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }

        let timeout_secs: u64 =
            env_parse(&lookup, "INTAKE_TIMEOUT_SECS", defaults.invoker.timeout.as_secs())?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INTAKE_TIMEOUT_SECS".into(),
                message: "must be at least 1".into(),
            });
        }

        let max_message_bytes: usize =
            env_parse(&lookup, "INTAKE_MAX_MESSAGE_BYTES", defaults.max_message_bytes)?;
        if max_message_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "INTAKE_MAX_MESSAGE_BYTES".into(),
                message: "must be positive".into(),
            });
        }

        let invoker = InvokerConfig {
            concurrency,
            timeout: Duration::from_secs(timeout_secs),
            memory_mb: env_parse(&lookup, "INTAKE_MEMORY_MB", defaults.invoker.memory_mb)?,
            admission,
        };

        let retention = RetentionConfig {
            sweep_interval: Duration::from_secs(env_parse(
                &lookup,
                "INTAKE_SWEEP_INTERVAL_SECS",
                defaults.retention.sweep_interval.as_secs(),
            )?),
            ..defaults.retention
        };

        let limit: Decimal = env_parse(&lookup, "INTAKE_BUDGET_LIMIT", defaults.budget.limit)?;
        if limit <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                key: "INTAKE_BUDGET_LIMIT".into(),
                message: "must be positive".into(),
            });
        }

        let thresholds = match lookup("INTAKE_BUDGET_THRESHOLDS") {
            Some(raw) => parse_thresholds(&raw)?,
            None => defaults.budget.thresholds,
        };

        let budget = BudgetConfig {
            limit,
            currency: env_or("INTAKE_BUDGET_CURRENCY", &defaults.budget.currency),
            thresholds,
            check_schedule: env_or("INTAKE_COST_CHECK_CRON", &defaults.budget.check_schedule),
        };

        Ok(Self {
            domain_name: env_or("INTAKE_DOMAIN_NAME", &defaults.domain_name),
            recipient_local_part: env_or(
                "INTAKE_RECIPIENT_LOCAL_PART",
                &defaults.recipient_local_part,
            ),
            bucket_name,
            raw_prefix: defaults.raw_prefix,
            db_path: lookup("INTAKE_DB_PATH").map(PathBuf::from),
            http_port: env_parse(&lookup, "INTAKE_HTTP_PORT", defaults.http_port)?,
            max_message_bytes,
            invoker,
            retention,
            budget,
            pricing: defaults.pricing,
            app_name,
        })
    }

    /// The one recipient address the relay accepts.
    pub fn recipient(&self) -> String {
        format!("{}@{}", self.recipient_local_part, self.domain_name)
    }

    /// Name of the processing function.
    pub fn function_name(&self) -> String {
        self.app_name.clone()
    }

    /// Root of the readable parameter namespace, with trailing slash.
    pub fn parameter_prefix(&self) -> String {
        format!("/{}/", self.app_name)
    }

    pub fn api_key_param(&self) -> String {
        format!("{}anthropic-api-key", self.parameter_prefix())
    }

    pub fn allowed_senders_param(&self) -> String {
        format!("{}allowed-senders", self.parameter_prefix())
    }

    pub fn budget_name(&self) -> String {
        format!("{}-monthly", self.app_name)
    }

    pub fn budget_topic_name(&self) -> String {
        format!("{}-budget-alerts", self.app_name)
    }

    /// Environment handed to each processor invocation.
    pub fn processor_env(&self) -> ProcessorEnv {
        ProcessorEnv {
            bucket_name: self.bucket_name.clone(),
            domain_name: self.domain_name.clone(),
            api_key_param: self.api_key_param(),
            allowed_senders_param: self.allowed_senders_param(),
        }
    }

    /// Retention rules for the raw email prefix.
    ///
    /// Tag-filtered rule first: processed artifacts expire sooner.
    pub fn retention_rules(&self) -> Vec<RetentionRule> {
        vec![
            RetentionRule::new(
                "processed-raw-emails",
                &self.raw_prefix,
                chrono::Duration::days(self.retention.processed_days),
            )
            .with_tag_filter(TagFilter::new(STATUS_TAG, PROCESSED)),
            RetentionRule::new(
                "raw-emails",
                &self.raw_prefix,
                chrono::Duration::days(self.retention.unprocessed_days),
            ),
        ]
    }
}

/// Configuration keys a processing function reads at invocation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorEnv {
    pub bucket_name: String,
    pub domain_name: String,
    pub api_key_param: String,
    pub allowed_senders_param: String,
}

impl ProcessorEnv {
    pub const BUCKET_NAME: &'static str = "BUCKET_NAME";
    pub const DOMAIN_NAME: &'static str = "DOMAIN_NAME";
    pub const SSM_API_KEY_PARAM: &'static str = "SSM_API_KEY_PARAM";
    pub const SSM_ALLOWED_SENDERS_PARAM: &'static str = "SSM_ALLOWED_SENDERS_PARAM";

    /// Render as environment-style key/value pairs.
    pub fn to_vars(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (Self::BUCKET_NAME, self.bucket_name.clone()),
            (Self::DOMAIN_NAME, self.domain_name.clone()),
            (Self::SSM_API_KEY_PARAM, self.api_key_param.clone()),
            (Self::SSM_ALLOWED_SENDERS_PARAM, self.allowed_senders_param.clone()),
        ])
    }

    /// Read the four keys through `lookup`. Every key is required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.into()));
        Ok(Self {
            bucket_name: get(Self::BUCKET_NAME)?,
            domain_name: get(Self::DOMAIN_NAME)?,
            api_key_param: get(Self::SSM_API_KEY_PARAM)?,
            allowed_senders_param: get(Self::SSM_ALLOWED_SENDERS_PARAM)?,
        })
    }

    /// Read the four keys from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

fn env_parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

/// Parse a comma-separated list of percentages. Must be positive and strictly ascending.
pub fn parse_thresholds(raw: &str) -> Result<Vec<Decimal>, ConfigError> {
    let key = "INTAKE_BUDGET_THRESHOLDS";
    let thresholds = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_value::<Decimal>(key, s))
        .collect::<Result<Vec<_>, _>>()?;

    if thresholds.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: key.into(),
            message: "at least one threshold is required".into(),
        });
    }
    if thresholds.iter().any(|t| *t <= Decimal::ZERO) {
        return Err(ConfigError::InvalidValue {
            key: key.into(),
            message: "thresholds must be positive".into(),
        });
    }
    if thresholds.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ConfigError::InvalidValue {
            key: key.into(),
            message: "thresholds must be strictly ascending".into(),
        });
    }
    Ok(thresholds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployed_limits() {
        let config = IntakeConfig::default();
        assert_eq!(config.invoker.concurrency, 2);
        assert_eq!(config.invoker.timeout, Duration::from_secs(300));
        assert_eq!(config.invoker.memory_mb, 1024);
        assert_eq!(config.budget.limit, dec!(10));
        assert_eq!(config.budget.thresholds, vec![dec!(50), dec!(80), dec!(100)]);
        assert_eq!(config.recipient(), "receipts@hsa.example.com");
    }

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = IntakeConfig::from_lookup(lookup_from(&[
            ("INTAKE_APP_NAME", "archiver"),
            ("INTAKE_TIMEOUT_SECS", "30"),
            ("INTAKE_MAX_MESSAGE_BYTES", "1048576"),
        ]))
        .unwrap();
        assert_eq!(config.bucket_name, "archiver-receipts");
        assert_eq!(config.invoker.timeout, Duration::from_secs(30));
        assert_eq!(config.max_message_bytes, 1024 * 1024);

        let defaults = IntakeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(defaults.max_message_bytes, 40 * 1024 * 1024);
    }

    #[test]
    fn zero_limits_are_rejected() {
        for key in [
            "INTAKE_TIMEOUT_SECS",
            "INTAKE_CONCURRENCY",
            "INTAKE_MAX_MESSAGE_BYTES",
        ] {
            match IntakeConfig::from_lookup(lookup_from(&[(key, "0")])) {
                Err(ConfigError::InvalidValue { key: got, .. }) => assert_eq!(got, key),
                other => panic!("expected InvalidValue for {key}, got {other:?}"),
            }
        }
    }

    #[test]
    fn parameter_paths_rooted_at_app_namespace() {
        let config = IntakeConfig::default();
        assert_eq!(config.parameter_prefix(), "/hsa-receipt-archiver/");
        assert_eq!(config.api_key_param(), "/hsa-receipt-archiver/anthropic-api-key");
        assert_eq!(
            config.allowed_senders_param(),
            "/hsa-receipt-archiver/allowed-senders"
        );
    }

    #[test]
    fn processor_env_round_trips_through_vars() {
        let env = IntakeConfig::default().processor_env();
        let vars = env.to_vars();
        assert_eq!(vars["BUCKET_NAME"], "hsa-receipts");
        assert_eq!(vars["DOMAIN_NAME"], "hsa.example.com");

        let parsed = ProcessorEnv::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(parsed, env);
    }

    #[test]
    fn processor_env_requires_every_key() {
        let result = ProcessorEnv::from_lookup(|k| {
            (k != ProcessorEnv::SSM_API_KEY_PARAM).then(|| "x".to_string())
        });
        match result {
            Err(ConfigError::MissingEnvVar(key)) => assert_eq!(key, "SSM_API_KEY_PARAM"),
            other => panic!("expected MissingEnvVar, got {other:?}"),
        }
    }

    #[test]
    fn retention_rules_put_tag_filter_first() {
        let rules = IntakeConfig::default().retention_rules();
        assert_eq!(rules.len(), 2);
        assert!(rules[0].tag_filter.is_some());
        assert_eq!(rules[0].expiration, chrono::Duration::days(7));
        assert!(rules[1].tag_filter.is_none());
        assert_eq!(rules[1].expiration, chrono::Duration::days(30));
    }

    #[test]
    fn thresholds_parse_and_validate() {
        assert_eq!(
            parse_thresholds("50, 80,100").unwrap(),
            vec![dec!(50), dec!(80), dec!(100)]
        );
        assert!(parse_thresholds("80,50").is_err());
        assert!(parse_thresholds("").is_err());
        assert!(parse_thresholds("0,50").is_err());
        assert!(parse_thresholds("fifty").is_err());
    }
}
