//! Periodic signals that stop with the shutdown gate

use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::shutdown::ShutdownCoordinator;

/// Start a named periodic timer
///
/// The first tick fires after `initial_delay`, then every `period`. The timer
/// counts as in-flight work on `coordinator` and stops once its gate closes;
/// the returned receiver then yields `None`. Ticks are dropped rather than
/// queued when the consumer lags behind.
pub fn ticker(
    name: &str,
    period: Duration,
    initial_delay: Duration,
    coordinator: &ShutdownCoordinator,
) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);

    let Some(in_flight) = coordinator.try_register() else {
        debug!(timer = name, "Gate already closed, timer not started");
        return rx;
    };

    let coordinator = coordinator.clone();
    let name = name.to_string();

    tokio::spawn(async move {
        let _in_flight = in_flight;
        let mut interval = tokio::time::interval_at(Instant::now() + initial_delay, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = coordinator.closed() => {
                    info!(timer = %name, "Timer shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(TrySendError::Closed(())) = tx.try_send(()) {
                        debug!(timer = %name, "Timer receiver gone");
                        return;
                    }
                }
            }
        }
    });

    rx
}
