//! Periodic background tasks sharing one cancellation token.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Runs closures on a fixed period until stopped.
///
/// Each tick runs on the blocking pool. Cancellation is observed between
/// ticks only, so a tick in progress always finishes.
pub struct Scheduler {
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Starts a task whose first tick is one full `period` from now.
    /// Must be called from within a tokio runtime.
    pub fn spawn_periodic<F>(&self, name: &'static str, period: Duration, tick: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let token = self.token.clone();
        let tick = Arc::new(tick);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let tick = tick.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || tick()).await {
                            error!(task = name, "Periodic task failed: {}", e);
                        }
                    }
                }
            }
            debug!(task = name, "Periodic task stopped");
        });

        self.handles.lock().push(handle);
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels every task and waits for them to exit
    pub async fn stop(&self) {
        self.token.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Periodic task join failed: {}", e);
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
