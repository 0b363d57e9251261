//! Background tasks — the periodic expiry sweep.
//!
//! Reads already refuse expired entries, so the sweeper only reclaims space:
//! every interval it walks the whole store and deletes whatever has expired.
//! A sweep that races a concurrent `set` for the same key may delete the fresh
//! value; the next request simply repopulates it.

use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;

/// Time between sweeps unless configured otherwise.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of one pass over the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records decoded successfully.
    pub scanned: usize,
    /// Decoded records whose expiry had passed.
    pub expired: usize,
    /// Expired records actually removed.
    pub deleted: usize,
    /// Records that could not be read or decoded and were left alone.
    pub skipped: usize,
}

/// Deletes every entry in `store` that is expired at `now`.
///
/// Unreadable records and failed deletes are logged and skipped; one bad
/// record never ends the pass early.
pub fn sweep(store: &CacheStore, now: SystemTime) -> SweepReport {
    let mut report = SweepReport::default();

    for item in store.scan_all() {
        let (key, entry) = match item {
            Ok(pair) => pair,
            Err(e) => {
                report.skipped += 1;
                warn!(error = %e, "skipping unreadable cache record");
                continue;
            }
        };
        report.scanned += 1;

        if entry.is_fresh_at(now) {
            continue;
        }
        report.expired += 1;

        match store.delete(&key) {
            Ok(()) => report.deleted += 1,
            Err(e) => warn!(%key, error = %e, "failed to delete expired entry"),
        }
    }

    report
}

/// Periodically purges expired entries from a [`CacheStore`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use cachegate::background::ExpirySweeper;
/// use cachegate::cache::CacheStore;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn demo() {
/// let shutdown = CancellationToken::new();
/// let handle = ExpirySweeper::new(CacheStore::in_memory(), Duration::from_secs(60))
///     .spawn(shutdown.clone());
///
/// shutdown.cancel();
/// handle.await.unwrap();
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ExpirySweeper {
    store: CacheStore,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(store: CacheStore, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs a single pass as of `now`.
    pub fn sweep_once(&self, now: SystemTime) -> SweepReport {
        sweep(&self.store, now)
    }

    /// Sweeps immediately, then once per interval, until `shutdown` fires.
    ///
    /// The scan itself is blocking and runs on Tokio's blocking pool.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "expiry sweeper started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let store = self.store.clone();
            match tokio::task::spawn_blocking(move || sweep(&store, SystemTime::now())).await {
                Ok(report) if report.deleted > 0 || report.skipped > 0 => {
                    info!(
                        scanned = report.scanned,
                        deleted = report.deleted,
                        skipped = report.skipped,
                        "expiry sweep finished"
                    );
                }
                Ok(report) => debug!(scanned = report.scanned, "expiry sweep found nothing to purge"),
                Err(e) => error!(error = %e, "expiry sweep task failed"),
            }
        }

        info!("expiry sweeper stopped");
    }

    /// Spawns [`run`](Self::run) onto the current runtime.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
