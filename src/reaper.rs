use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;
use crate::identity::Actor;
use crate::model::{Ms, Progress};
use crate::timeutil::now_ms;

/// Compact the WAL whenever enough appends have piled up since the last one.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!(appends, "compacted WAL"),
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}

/// Mark in-progress bookings whose end has passed as completed.
/// Returns how many were flipped.
pub async fn complete_overdue(engine: &Engine, now: Ms) -> usize {
    let actor = Actor::system();
    let mut done = 0;
    for booking in engine.overdue_in_progress(now).await {
        match engine.set_progress(&actor, booking.id, Progress::Completed).await {
            Ok(_) => done += 1,
            // changed or deleted since the scan
            Err(e) => debug!("sweeper skip {}: {e}", booking.id),
        }
    }
    done
}

/// Opt-in background completion (`Config::auto_complete`).
pub async fn run_completion_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let done = complete_overdue(&engine, now_ms()).await;
        if done > 0 {
            info!(done, "auto-completed bookings");
        }
    }
}
