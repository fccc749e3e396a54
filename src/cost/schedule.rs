//! Cron-driven cost check loop.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::{BudgetAlert, CostMonitor, CostSource};
use crate::error::CostError;

fn parse_schedule(schedule: &str) -> Result<cron::Schedule, CostError> {
    cron::Schedule::from_str(schedule).map_err(|e| CostError::Schedule(format!("{schedule}: {e}")))
}

/// Next time the cost check fires after `after`.
pub fn next_check(schedule: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CostError> {
    Ok(parse_schedule(schedule)?.after(&after).next())
}

/// Read month-to-date cost once and feed it to the monitor.
pub async fn check_once(
    source: &dyn CostSource,
    monitor: &CostMonitor,
    now: DateTime<Utc>,
) -> Result<Vec<BudgetAlert>, CostError> {
    let observation = source.month_to_date(now).await?;
    info!(
        budget = %monitor.budget_name(),
        actual = %observation.amount,
        "Cost check"
    );
    monitor.observe(observation).await
}

/// Spawn the periodic cost check. Fails up front if the schedule does not parse.
pub fn spawn_cost_check(
    source: Arc<dyn CostSource>,
    monitor: Arc<CostMonitor>,
    schedule: &str,
) -> Result<tokio::task::JoinHandle<()>, CostError> {
    let schedule = parse_schedule(schedule)?;

    Ok(tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Cost check schedule has no upcoming fire time, stopping");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            if let Err(e) = check_once(source.as_ref(), &monitor, Utc::now()).await {
                error!(budget = %monitor.budget_name(), error = %e, "Cost check failed");
            }
        }
    }))
}
