//! Stage progress counters and a background progress logger.
//!
//! Validation and check stages can run for hours; the monitor periodically
//! logs how many items have been appended or failed so operators can follow
//! a run without tailing the ledgers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Snapshot of a stage's counters at a point in time.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub planned: usize,
    pub appended: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub elapsed: Duration,
}

/// Shared atomic counters for one stage run.
///
/// Cloned into every worker future and incremented via `fetch_add`.
#[derive(Debug, Clone, Default)]
pub struct StageCounters {
    /// Items handed to the runner.
    pub planned: Arc<AtomicUsize>,
    /// Records appended to the stage ledger.
    pub appended: Arc<AtomicUsize>,
    /// Worker calls that failed or timed out.
    pub failed: Arc<AtomicUsize>,
    /// Worker calls currently running.
    pub in_flight: Arc<AtomicUsize>,
}

impl StageCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            planned: self.planned.load(Ordering::Relaxed),
            appended: self.appended.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }
}

/// Final accounting for one stage invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    /// Items the planner scheduled.
    pub planned: usize,
    /// Records appended during this run.
    pub appended: usize,
    /// Items whose worker call failed; they remain in the deficit.
    pub failed: usize,
    /// True when the planner found nothing to do.
    pub skipped: bool,
}

impl StageReport {
    pub fn skipped(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            skipped: true,
            ..Self::default()
        }
    }

    pub fn from_counters(stage: impl Into<String>, counters: &StageCounters) -> Self {
        let snap = counters.snapshot(Instant::now());
        Self {
            stage: stage.into(),
            planned: snap.planned,
            appended: snap.appended,
            failed: snap.failed,
            skipped: false,
        }
    }

    /// Every planned item produced a record.
    pub fn is_complete(&self) -> bool {
        self.appended >= self.planned
    }
}

/// A background task that periodically logs stage progress.
///
/// Call [`ProgressMonitor::stop`] to cancel; dropping also stops it at the
/// next tick.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    pub fn start(stage: String, counters: StageCounters, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let done = snap.appended + snap.failed;
                let pct = if snap.planned > 0 {
                    (done as f64 / snap.planned as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };

                tracing::info!(
                    stage = %stage,
                    planned = snap.planned,
                    appended = snap.appended,
                    failed = snap.failed,
                    in_flight = snap.in_flight,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = snap.elapsed.as_secs(),
                    "Stage progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
