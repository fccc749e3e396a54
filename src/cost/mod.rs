//! Budget monitoring: fire-once threshold alerts against a monthly limit.
//!
//! A [`CostSource`] produces month-to-date [`CostObservation`]s, the
//! [`CostMonitor`] compares them against the configured thresholds and
//! publishes one [`BudgetAlert`] per threshold per [`BillingPeriod`]. Alerts
//! are notifications only; nothing here ever stops spending.

pub mod monitor;
pub mod schedule;
pub mod usage;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::CostError;

pub use monitor::{CostMonitor, ThresholdState};
pub use schedule::{check_once, next_check, spawn_cost_check};
pub use usage::{UsageMeter, UsageTotals};

/// Comparator string carried in every alert.
pub const COMPARATOR: &str = "ACTUAL>threshold";

/// A calendar month in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BillingPeriod {
    pub year: i32,
    pub month: u32,
}

impl BillingPeriod {
    /// The period an instant falls in.
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Month-to-date actual cost at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostObservation {
    pub amount: Decimal,
    pub observed_at: DateTime<Utc>,
}

/// Payload published on the alert topic for one threshold crossing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetAlert {
    pub budget_name: String,
    pub threshold_percent: Decimal,
    pub comparator: String,
    pub limit_amount: Decimal,
    pub currency: String,
    pub actual_amount: Decimal,
    pub billing_period: String,
}

/// A threshold already fired in some period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredThreshold {
    pub threshold: Decimal,
    pub fired_at: DateTime<Utc>,
}

/// Produces month-to-date cost.
#[async_trait]
pub trait CostSource: Send + Sync {
    async fn month_to_date(&self, now: DateTime<Utc>) -> Result<CostObservation, CostError>;
}

/// Durable record of which thresholds fired in which period.
#[async_trait]
pub trait AlertLedger: Send + Sync {
    async fn fired_thresholds(
        &self,
        budget_name: &str,
        period: BillingPeriod,
    ) -> Result<Vec<FiredThreshold>, CostError>;

    async fn record_fired(
        &self,
        alert: &BudgetAlert,
        period: BillingPeriod,
        fired_at: DateTime<Utc>,
    ) -> Result<(), CostError>;
}

/// Durable month-to-date usage. Increments are applied by the store so that
/// concurrent writers and restarts never lose metered usage.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn add_usage(
        &self,
        period: BillingPeriod,
        delta: UsageTotals,
        at: DateTime<Utc>,
    ) -> Result<(), CostError>;

    /// Totals for `period`, zero if nothing was recorded.
    async fn usage(&self, period: BillingPeriod) -> Result<UsageTotals, CostError>;
}

/// Process-local ledger, used when no database is configured.
#[derive(Default)]
pub struct MemoryLedger {
    fired: RwLock<BTreeMap<(String, BillingPeriod), Vec<FiredThreshold>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertLedger for MemoryLedger {
    async fn fired_thresholds(
        &self,
        budget_name: &str,
        period: BillingPeriod,
    ) -> Result<Vec<FiredThreshold>, CostError> {
        Ok(self
            .fired
            .read()
            .await
            .get(&(budget_name.to_string(), period))
            .cloned()
            .unwrap_or_default())
    }

    async fn record_fired(
        &self,
        alert: &BudgetAlert,
        period: BillingPeriod,
        fired_at: DateTime<Utc>,
    ) -> Result<(), CostError> {
        let mut fired = self.fired.write().await;
        let entry = fired
            .entry((alert.budget_name.clone(), period))
            .or_default();
        if !entry.iter().any(|f| f.threshold == alert.threshold_percent) {
            entry.push(FiredThreshold {
                threshold: alert.threshold_percent,
                fired_at,
            });
        }
        Ok(())
    }
}
