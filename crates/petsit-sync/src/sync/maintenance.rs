//! Periodic tombstone garbage collection

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::ReconciliationEngine;

/// Purge tombstones older than `retention` every `interval`.
///
/// The returned handle is the only owner of the timer; abort it to stop.
pub fn spawn_tombstone_gc(
    engine: Arc<ReconciliationEngine>,
    interval: Duration,
    retention: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match engine.purge_tombstones(retention) {
                Ok(removed) => tracing::debug!(removed, "Tombstone GC pass finished"),
                Err(error) => tracing::warn!(%error, "Tombstone GC pass failed"),
            }
        }
    })
}
