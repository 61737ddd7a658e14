//! Background jobs driven by the composition root.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info};

use crate::services::orders::OrderService;

/// Spawns the periodic expiry sweep.
///
/// The first run happens one `period` after start. A run that fails is
/// logged and retried on the next tick; ticks missed while a run is still
/// going are skipped rather than queued.
pub fn spawn_order_expiry_worker(orders: Arc<OrderService>, period: Duration) -> JoinHandle<()> {
    info!(period_secs = period.as_secs(), "Starting order expiry worker");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = orders.cancel_expired_unpaid_orders().await {
                error!(error = %e, "order expiry sweep failed");
            }
        }
    })
}
