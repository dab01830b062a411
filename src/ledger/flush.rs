use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::LedgerCache;

/// Sweeps between heartbeat log lines when nothing was flushed.
const HEARTBEAT_CYCLES: u64 = 10;

#[derive(Debug)]
pub(crate) struct FlushWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl FlushWorker {
    /// `eviction_wanted` is signalled by cache hits that left dirty overflow behind.
    pub fn spawn(
        cache: Weak<LedgerCache>,
        interval: Duration,
        eviction_wanted: Arc<Notify>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(cache, interval, eviction_wanted, cancel.clone()));
        Self { cancel, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancellation is observed between sweeps, so a sweep in progress completes.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            tracing::warn!(error = %err, "background flush task ended abnormally");
        }
    }
}

async fn run(
    cache: Weak<LedgerCache>,
    interval: Duration,
    eviction_wanted: Arc<Notify>,
    cancel: CancellationToken,
) {
    tracing::info!(
        interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        "background ledger flush started"
    );

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles: u64 = 0;

    loop {
        let evict_only = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = eviction_wanted.notified() => true,
            _ = ticker.tick() => false,
        };

        // The cache owns the worker; once it is dropped there is nothing left to flush.
        let Some(cache) = cache.upgrade() else {
            break;
        };

        if evict_only {
            cache.evict_quietly().await;
            continue;
        }

        let report = cache.flush_dirty().await;
        cache.evict_quietly().await;
        cycles += 1;

        if report.flushed > 0 || report.failed > 0 || report.superseded > 0 {
            tracing::info!(
                cycle = cycles,
                flushed = report.flushed,
                failed = report.failed,
                superseded = report.superseded,
                "background ledger flush"
            );
        } else if cycles % HEARTBEAT_CYCLES == 0 {
            let health = cache.health().await;
            tracing::info!(
                cycle = cycles,
                cache_size = health.cache_size,
                dirty_entries = health.dirty_entries,
                total_flushes = health.total_flushes,
                "background ledger flush heartbeat"
            );
        }
    }

    tracing::debug!(cycles, "background ledger flush stopped");
}
