use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};
use crate::model::{Ms, HOUR_MS};
use crate::observability::{SWEEP_DURATION_SECONDS, SWEEPER_EXPIRED_TOTAL, SWEEPER_FLAGGED_TOTAL};

#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    pub interval: Duration,
    /// Open transactions older than this are flagged for review.
    pub max_stay_ms: Ms,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_stay_ms: 72 * HOUR_MS,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub flagged: usize,
    /// Candidates another writer settled first, or that failed to persist.
    pub skipped: usize,
}

/// One reconciliation pass. Every reservation and transaction is settled in
/// its own engine call; no lock is held across the scan.
pub async fn sweep_once(engine: &Engine, now: Ms, max_stay_ms: Ms) -> SweepReport {
    let mut report = SweepReport::default();

    for reservation_id in engine.collect_lapsed_reservations(now) {
        match engine.expire_reservation_at(reservation_id, now).await {
            Ok(true) => {
                info!(reservation = %reservation_id, "expired lapsed reservation");
                report.expired += 1;
            }
            Ok(false) => report.skipped += 1,
            Err(e) => {
                debug!(reservation = %reservation_id, "sweeper skip: {e}");
                report.skipped += 1;
            }
        }
    }

    for transaction_id in engine.collect_overdue_transactions(now, max_stay_ms) {
        match engine.flag_transaction(transaction_id, now).await {
            Ok(true) => report.flagged += 1,
            Ok(false) => report.skipped += 1,
            Err(e) => {
                warn!(transaction = %transaction_id, "could not flag overdue transaction: {e}");
                report.skipped += 1;
            }
        }
    }

    metrics::counter!(SWEEPER_EXPIRED_TOTAL).increment(report.expired as u64);
    metrics::counter!(SWEEPER_FLAGGED_TOTAL).increment(report.flagged as u64);
    report
}

/// Background task: the only writer that corrects abandoned state.
pub async fn run_sweeper(engine: Arc<Engine>, config: SweepConfig) {
    let mut interval = tokio::time::interval(config.interval);
    loop {
        interval.tick().await;
        let started = std::time::Instant::now();
        let report = sweep_once(&engine, now_ms(), config.max_stay_ms).await;
        metrics::histogram!(SWEEP_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if report != SweepReport::default() {
            debug!(?report, "sweep finished");
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("WAL compacted"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
