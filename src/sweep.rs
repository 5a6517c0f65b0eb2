use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::engine::{Engine, EngineError};
use crate::model::Ms;

fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// One expiration pass. Store failures are logged and counted, never returned,
/// so a dead store only delays finalization until the next tick.
pub async fn sweep_once(engine: &Engine, now: Ms) -> usize {
    metrics::counter!(crate::observability::SWEEP_RUNS_TOTAL).increment(1);
    match engine.finalize_expired(now).await {
        Ok(0) => {
            debug!("sweep: nothing expired");
            0
        }
        Ok(n) => {
            info!("sweep: finalized {n} reservations");
            metrics::counter!(crate::observability::SWEEP_FINALIZED_TOTAL).increment(n as u64);
            n
        }
        Err(e) => {
            error!("sweep failed, retrying next tick: {e}");
            metrics::counter!(crate::observability::SWEEP_FAILURES_TOTAL).increment(1);
            0
        }
    }
}

/// Expiration sweep. The first tick fires immediately, so one pass runs at startup.
pub async fn run_sweep(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        sweep_once(&engine, now_ms()).await;
    }
}

/// Rewrite the log once enough appends have piled up since the last rewrite.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> Result<Option<usize>, EngineError> {
    let appended = engine.appends_since_compact().await?;
    if appended < threshold {
        return Ok(None);
    }
    let kept = engine.compact_wal().await?;
    info!("compacted reservation log: {appended} appends folded into {kept} events");
    Ok(Some(kept))
}

pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_due(&engine, threshold).await {
            error!("compaction failed: {e}");
        }
    }
}
