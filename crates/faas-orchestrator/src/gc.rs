//! Background eviction of stale invocation records.

use crate::config::ControlPlaneConfig;
use crate::lifecycle::LifecycleTracker;
use chrono::Utc;
use faas_common::{FaasError, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// One eviction pass over the tracker; returns how many records were dropped.
pub type SweepFn = dyn Fn(&LifecycleTracker, Duration) -> Result<usize> + Send + Sync;

/// Periodically drops records older than the retention window. Eviction is
/// bookkeeping only; it does not cancel the underlying execution.
#[derive(Clone)]
pub struct GarbageCollector {
    tracker: Arc<LifecycleTracker>,
    interval: Duration,
    retry_interval: Duration,
    retention: Duration,
    sweep: Arc<SweepFn>,
}

impl fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("interval", &self.interval)
            .field("retry_interval", &self.retry_interval)
            .field("retention", &self.retention)
            .field("tracked", &self.tracker.len())
            .finish()
    }
}

impl GarbageCollector {
    pub fn new(tracker: Arc<LifecycleTracker>, config: &ControlPlaneConfig) -> Self {
        Self {
            tracker,
            interval: config.gc_interval,
            retry_interval: config.gc_retry_interval,
            retention: config.retention,
            sweep: Arc::new(|tracker: &LifecycleTracker, retention: Duration| -> Result<usize> {
                Ok(tracker.sweep_expired(Utc::now(), retention))
            }),
        }
    }

    /// Replaces the eviction pass, e.g. to sweep an external index as well.
    pub fn with_sweep<F>(mut self, sweep: F) -> Self
    where
        F: Fn(&LifecycleTracker, Duration) -> Result<usize> + Send + Sync + 'static,
    {
        self.sweep = Arc::new(sweep);
        self
    }

    /// Runs one sweep on the blocking pool. A panic inside the sweep is
    /// reported as an error instead of unwinding into the caller.
    pub async fn sweep_once(&self) -> Result<usize> {
        let tracker = self.tracker.clone();
        let sweep = self.sweep.clone();
        let retention = self.retention;
        tokio::task::spawn_blocking(move || sweep(&*tracker, retention))
            .await
            .map_err(|e| FaasError::Internal(format!("Garbage collection sweep failed: {}", e)))?
    }

    /// Starts the sweep loop. The loop only stops when the handle is dropped.
    pub fn spawn(self) -> GcHandle {
        info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "Starting invocation record garbage collector"
        );
        GcHandle {
            task: tokio::spawn(self.run()),
        }
    }

    async fn run(self) {
        loop {
            let pause = match self.sweep_once().await {
                Ok(evicted) => {
                    if evicted > 0 {
                        info!(evicted, remaining = self.tracker.len(), "Evicted expired invocation records");
                    } else {
                        debug!("No expired invocation records");
                    }
                    self.interval
                }
                Err(e) => {
                    error!(error = %e, retry_secs = self.retry_interval.as_secs(), "Error in cleanup task");
                    self.retry_interval
                }
            };
            tokio::time::sleep(pause).await;
        }
    }
}

/// Owns the running collector task and aborts it on drop.
#[derive(Debug)]
pub struct GcHandle {
    task: JoinHandle<()>,
}

impl GcHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for GcHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
