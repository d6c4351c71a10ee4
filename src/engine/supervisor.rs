// =============================================================================
// Supervisor — lifecycle of the engine's background tasks
// =============================================================================
//
// Owns the stop signal and the join handles. Cancellation is cooperative:
// tasks watch the signal between blocking boundaries and return promptly;
// anything still running after the grace period is aborted.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{TickCache, WarmCache};
use crate::positions::ActiveCache;

/// How long stop() waits for tasks before aborting them.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Stale-tick threshold for the prune sweeps.
const PRUNE_MAX_AGE_SECS: i64 = 30;

/// Prune cadence.
const PRUNE_EVERY: Duration = Duration::from_secs(30);

/// Task lifecycle owner.
pub struct Supervisor {
    stop_tx: watch::Sender<bool>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// A fresh receiver of the stop signal for a task to watch.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Spawn and register a named task.
    pub fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        debug!(task = name, "supervisor spawning task");
        let handle = tokio::spawn(future);
        self.handles.lock().push((name.to_string(), handle));
    }

    /// Flip the stop signal and wait for every task, aborting stragglers
    /// after the grace period.
    pub async fn stop(&self) {
        info!("supervisor stopping all tasks");
        let _ = self.stop_tx.send(true);

        let handles: Vec<(String, JoinHandle<()>)> =
            self.handles.lock().drain(..).collect();

        for (name, handle) in handles {
            match tokio::time::timeout(STOP_GRACE, handle).await {
                Ok(Ok(())) => debug!(task = %name, "task stopped cleanly"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "task ended with error"),
                Err(_) => {
                    warn!(task = %name, "task missed the stop deadline — aborted");
                }
            }
        }
        info!("supervisor stop complete");
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("tasks", &self.handles.lock().len())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

/// Stale-tick pruner: sweep the hot and warm caches, sparing index feeds
/// and instruments with live positions. Spawned by main under the
/// supervisor.
pub async fn run_prune_loop(
    tick_cache: Arc<TickCache>,
    warm: Arc<WarmCache>,
    active_cache: Arc<ActiveCache>,
    mut stop: watch::Receiver<bool>,
) {
    info!(every_secs = PRUNE_EVERY.as_secs(), "tick pruner started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(PRUNE_EVERY) => {}
            _ = stop.changed() => break,
        }
        if *stop.borrow() {
            break;
        }

        let protected = active_cache.instrument_keys();
        let now = chrono::Utc::now().timestamp();
        let hot_evicted = tick_cache.prune_stale(&protected, PRUNE_MAX_AGE_SECS, now);
        match warm.prune_stale(&protected, PRUNE_MAX_AGE_SECS).await {
            Ok(stats) if stats.evicted > 0 || hot_evicted > 0 => {
                debug!(
                    hot_evicted,
                    warm_evicted = stats.evicted,
                    "prune sweep evicted stale ticks"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "warm prune sweep failed"),
        }
    }
    info!("tick pruner stopped");
}
