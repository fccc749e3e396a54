//! Per-threshold ARMED/FIRED state machine.
//!
//! Within a billing period a threshold moves from `Armed` to `Fired` exactly
//! once, and only after its alert was published. Entering a later period
//! (explicitly via [`CostMonitor::roll_over`], or by observing a cost stamped
//! in that period) re-arms every threshold.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{AlertLedger, BillingPeriod, BudgetAlert, COMPARATOR, CostObservation};
use crate::config::BudgetConfig;
use crate::error::{CostError, NotifyError};
use crate::notify::TopicHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdState {
    Armed,
    Fired { at: DateTime<Utc> },
}

struct MonitorState {
    period: Option<BillingPeriod>,
    thresholds: Vec<(Decimal, ThresholdState)>,
}

/// Watches month-to-date cost against one budget.
pub struct CostMonitor {
    budget_name: String,
    limit: Decimal,
    currency: String,
    topic: TopicHandle,
    ledger: Option<Arc<dyn AlertLedger>>,
    state: Mutex<MonitorState>,
}

impl CostMonitor {
    pub fn new(budget_name: impl Into<String>, budget: &BudgetConfig, topic: TopicHandle) -> Self {
        let thresholds = budget
            .thresholds
            .iter()
            .map(|t| (*t, ThresholdState::Armed))
            .collect();
        Self {
            budget_name: budget_name.into(),
            limit: budget.limit,
            currency: budget.currency.clone(),
            topic,
            ledger: None,
            state: Mutex::new(MonitorState {
                period: None,
                thresholds,
            }),
        }
    }

    /// Persist fired thresholds so a restart does not re-fire them.
    pub fn with_ledger(mut self, ledger: Arc<dyn AlertLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn budget_name(&self) -> &str {
        &self.budget_name
    }

    pub async fn current_period(&self) -> Option<BillingPeriod> {
        self.state.lock().await.period
    }

    /// Snapshot of every threshold's state.
    pub async fn states(&self) -> Vec<(Decimal, ThresholdState)> {
        self.state.lock().await.thresholds.clone()
    }

    /// Re-arm all thresholds for `period`. Ignored unless `period` is later
    /// than the current one. Returns whether a rollover happened.
    pub async fn roll_over(&self, period: BillingPeriod) -> Result<bool, CostError> {
        let mut state = self.state.lock().await;
        if state.period.is_some_and(|current| period <= current) {
            debug!(budget = %self.budget_name, period = %period, "Rollover ignored, not a later period");
            return Ok(false);
        }
        self.enter_period(&mut state, period).await?;
        Ok(true)
    }

    /// Evaluate an observation and publish an alert for every armed threshold
    /// it crosses. Returns the alerts published.
    ///
    /// If a publish fails the threshold stays armed and the error is returned,
    /// so the next observation retries it.
    pub async fn observe(&self, observation: CostObservation) -> Result<Vec<BudgetAlert>, CostError> {
        let period = BillingPeriod::containing(observation.observed_at);
        let mut state = self.state.lock().await;

        match state.period {
            Some(current) if period < current => {
                warn!(
                    budget = %self.budget_name,
                    observed_period = %period,
                    current_period = %current,
                    "Ignoring cost observation from an earlier period"
                );
                return Ok(Vec::new());
            }
            Some(current) if period == current => {}
            _ => self.enter_period(&mut state, period).await?,
        }

        let mut alerts = Vec::new();
        for (threshold, threshold_state) in state.thresholds.iter_mut() {
            if *threshold_state != ThresholdState::Armed {
                continue;
            }
            // actual/limit*100 > threshold, kept division-free
            if observation.amount * Decimal::ONE_HUNDRED <= *threshold * self.limit {
                continue;
            }

            let alert = BudgetAlert {
                budget_name: self.budget_name.clone(),
                threshold_percent: *threshold,
                comparator: COMPARATOR.to_string(),
                limit_amount: self.limit,
                currency: self.currency.clone(),
                actual_amount: observation.amount,
                billing_period: period.to_string(),
            };
            self.publish(&alert).await?;

            *threshold_state = ThresholdState::Fired {
                at: observation.observed_at,
            };
            info!(
                budget = %self.budget_name,
                threshold = %threshold,
                actual = %observation.amount,
                limit = %self.limit,
                period = %period,
                "Budget threshold crossed"
            );

            if let Some(ref ledger) = self.ledger {
                if let Err(e) = ledger.record_fired(&alert, period, observation.observed_at).await {
                    warn!(budget = %self.budget_name, threshold = %threshold, error = %e, "Failed to persist fired threshold");
                }
            }
            alerts.push(alert);
        }

        Ok(alerts)
    }

    async fn publish(&self, alert: &BudgetAlert) -> Result<(), CostError> {
        let body = serde_json::to_value(alert).map_err(|e| NotifyError::PublishFailed {
            topic: self.topic.topic_name().to_string(),
            reason: e.to_string(),
        })?;
        let subject = format!(
            "Budget {}: actual cost exceeded {}% of {} {}",
            alert.budget_name, alert.threshold_percent, alert.limit_amount, alert.currency
        );
        self.topic.publish(&subject, body).await?;
        Ok(())
    }

    async fn enter_period(&self, state: &mut MonitorState, period: BillingPeriod) -> Result<(), CostError> {
        let fired = match self.ledger {
            Some(ref ledger) => ledger.fired_thresholds(&self.budget_name, period).await?,
            None => Vec::new(),
        };

        for (threshold, threshold_state) in state.thresholds.iter_mut() {
            *threshold_state = fired
                .iter()
                .find(|f| f.threshold == *threshold)
                .map(|f| ThresholdState::Fired { at: f.fired_at })
                .unwrap_or(ThresholdState::Armed);
        }

        info!(
            budget = %self.budget_name,
            from = ?state.period.map(|p| p.to_string()),
            to = %period,
            already_fired = fired.len(),
            "Entered billing period"
        );
        state.period = Some(period);
        Ok(())
    }
}
