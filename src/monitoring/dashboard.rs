use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::info;

use crate::monitoring::metrics::log_stats_snapshot;
use crate::recorder::Recorder;

/// Spawn a background task that periodically logs the engine status and a
/// compact stats snapshot.
///
/// Paired with JSON `tracing` output this is the terminal "dashboard";
/// pipe it through `jq` on the operator side.
pub fn spawn_dashboard_task(recorder: Arc<Recorder>, period: Duration) -> JoinHandle<()> {
    let mut ticker = interval(period);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            let state = recorder.dashboard_state();
            info!(
                target: "metrics",
                event = "status",
                status = %state.status,
                authenticated = state.authenticated,
                date = %state.date,
                poll_count = state.poll_count,
                storage = %state.storage.backend,
                recent_errors = state.errors.len(),
                "recorder status"
            );
            log_stats_snapshot(&state.stats);
        }
    })
}
