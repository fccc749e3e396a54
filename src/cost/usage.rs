//! Usage-based cost: GB-seconds of invocation time plus a per-request charge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::{BillingPeriod, CostObservation, CostSource, UsageStore};
use crate::config::UsagePricing;
use crate::error::CostError;

/// MB-milliseconds in one GB-second.
const MB_MS_PER_GB_SECOND: u64 = 1024 * 1000;

/// Usage within one billing period. Memory time is kept in whole
/// MB-milliseconds so totals add up exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub memory_mb_ms: u64,
    pub requests: u64,
}

impl UsageTotals {
    pub fn invocation(duration: Duration, memory_mb: u32) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Self {
            memory_mb_ms: millis.saturating_mul(u64::from(memory_mb)),
            requests: 1,
        }
    }

    pub fn gb_seconds(&self) -> Decimal {
        Decimal::from(self.memory_mb_ms) / Decimal::from(MB_MS_PER_GB_SECOND)
    }

    fn add(&mut self, other: UsageTotals) {
        self.memory_mb_ms = self.memory_mb_ms.saturating_add(other.memory_mb_ms);
        self.requests = self.requests.saturating_add(other.requests);
    }
}

struct MeterState {
    period: Option<BillingPeriod>,
    totals: UsageTotals,
}

/// Meters processor invocations for the current billing period.
///
/// Without a [`UsageStore`] totals live in memory and start from zero on every
/// restart. With one, the store is the source of truth.
pub struct UsageMeter {
    pricing: UsagePricing,
    store: Option<Arc<dyn UsageStore>>,
    state: Mutex<MeterState>,
}

impl UsageMeter {
    pub fn new(pricing: UsagePricing) -> Self {
        Self {
            pricing,
            store: None,
            state: Mutex::new(MeterState {
                period: None,
                totals: UsageTotals::default(),
            }),
        }
    }

    /// Persist usage so month-to-date cost survives restarts.
    pub fn with_store(mut self, store: Arc<dyn UsageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Record one invocation. In-memory totals reset when `at` falls in a later period.
    pub async fn record(&self, duration: Duration, memory_mb: u32, at: DateTime<Utc>) {
        let period = BillingPeriod::containing(at);
        let delta = UsageTotals::invocation(duration, memory_mb);

        if let Some(store) = &self.store {
            if let Err(e) = store.add_usage(period, delta, at).await {
                error!(period = %period, error = %e, "Failed to persist metered usage");
            }
            debug!(period = %period, memory_mb_ms = delta.memory_mb_ms, "Invocation metered");
            return;
        }

        let mut state = self.state.lock().await;
        if state.period.is_none_or(|current| period > current) {
            state.period = Some(period);
            state.totals = UsageTotals::default();
        }
        state.totals.add(delta);
        debug!(
            period = %period,
            gb_seconds = %state.totals.gb_seconds(),
            requests = state.totals.requests,
            "Invocation metered"
        );
    }

    /// Totals for the period containing `now` (zero if nothing was metered in it).
    pub async fn totals(&self, now: DateTime<Utc>) -> Result<UsageTotals, CostError> {
        let period = BillingPeriod::containing(now);
        if let Some(store) = &self.store {
            return store.usage(period).await;
        }

        let state = self.state.lock().await;
        if state.period == Some(period) {
            Ok(state.totals)
        } else {
            Ok(UsageTotals::default())
        }
    }

    fn price(&self, totals: &UsageTotals) -> Decimal {
        totals.gb_seconds() * self.pricing.per_gb_second
            + Decimal::from(totals.requests) * self.pricing.per_request
    }
}

#[async_trait]
impl CostSource for UsageMeter {
    async fn month_to_date(&self, now: DateTime<Utc>) -> Result<CostObservation, CostError> {
        let totals = self.totals(now).await?;
        Ok(CostObservation {
            amount: self.price(&totals),
            observed_at: now,
        })
    }
}
