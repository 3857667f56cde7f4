use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::domain::{SettlementError, SettlementOrder};
use crate::ports::SettlementStore;

const BATCH_SIZE: i64 = 50;

/// Releases the holds of withdraw orders that were never confirmed.
///
/// Orders become eligible `grace` after their authorization expired. The store
/// skips rows other workers hold, so several instances can sweep at once.
pub async fn run_sweeper(store: Arc<dyn SettlementStore>, grace: Duration, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "withdraw order sweeper started");

    loop {
        match process_batch(store.as_ref(), grace, Utc::now()).await {
            Ok(cancelled) if !cancelled.is_empty() => {
                info!(count = cancelled.len(), "cancelled expired withdraw orders");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "sweeper batch error"),
        }

        sleep(interval).await;
    }
}

pub fn cutoff(now: DateTime<Utc>, grace: Duration) -> DateTime<Utc> {
    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
    now - grace
}

/// One sweep pass. Returns the orders moved to `cancel`.
pub async fn process_batch(
    store: &dyn SettlementStore,
    grace: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<SettlementOrder>, SettlementError> {
    let cancelled = store
        .cancel_expired_withdrawals(cutoff(now, grace), BATCH_SIZE)
        .await?;

    for order in &cancelled {
        debug!(
            order_id = %order.order_id,
            user_id = %order.uid,
            currency = %order.currency,
            amount = %order.amount,
            "withdraw hold released"
        );
    }

    Ok(cancelled)
}
